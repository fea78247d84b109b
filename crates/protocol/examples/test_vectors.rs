//! Generate wire test vectors for client implementations.
//!
//! Run with: cargo run --package protocol --example test_vectors

use protocol::{ClientHello, Frame, FrameCodec, InitialPayload, Packet, TerminalInfo};

fn main() {
    print_packet("keep_alive", &Packet::KeepAlive);
    print_packet("terminal_buffer_hello", &Packet::TerminalBuffer(b"hello\n".to_vec()));
    print_packet(
        "terminal_info_40x120",
        &Packet::TerminalInfo(TerminalInfo::new(40, 120)),
    );

    let hello = ClientHello {
        client_id: "laptop".to_string(),
        passkey: "s3cret".to_string(),
    };
    print_vector(
        "client_hello",
        &hello.to_msgpack().expect("serialization failed"),
    );

    let initial = InitialPayload {
        terminal: TerminalInfo::new(24, 80),
        environment: vec!["TERM=xterm".to_string()],
    };
    print_vector(
        "initial_payload_24x80",
        &initial.to_msgpack().expect("serialization failed"),
    );
}

/// Print the framed bytes of a packet, as they appear on the wire.
fn print_packet(name: &str, packet: &Packet) {
    let body = packet.encode().expect("serialization failed");
    let framed = FrameCodec::new()
        .encode(&Frame::new(body))
        .expect("framing failed");
    print_vector(name, &framed);
}

fn print_vector(name: &str, bytes: &[u8]) {
    print!("export const {} = new Uint8Array([", name);
    for (i, b) in bytes.iter().enumerate() {
        if i > 0 {
            print!(", ");
        }
        print!("{}", b);
    }
    println!("]);");
}
