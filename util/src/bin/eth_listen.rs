use clap::{App, Arg};
use linkchat::net::frame;
use linkchat::LinkSocket;

fn main() {
    let matches = App::new("eth_listen")
        .about("Dumps LinkChat frames seen on an interface")
        .arg(Arg::with_name("interface").required(true))
        .get_matches();

    let interface = matches.value_of("interface").unwrap();

    let socket = LinkSocket::capture(interface).expect("Error opening raw socket (run as root)");
    let mut buf = vec![0u8; frame::MAX_FRAME_SIZE];

    println!("listening on {} for ethertype {:#06x}", interface, frame::ETHERTYPE);

    loop {
        let len = socket.recv_raw(&mut buf).expect("Error receiving frame");

        let ether = match frame::decode_frame(&buf[..len]) {
            Some(ether) => ether,
            None => continue,
        };

        if ether.ethertype != frame::ETHERTYPE {
            continue;
        }

        match frame::decode_app(ether.payload) {
            Ok(packet) => println!(
                "[{}] kind={:?} channel={} seq={} id={} len={}",
                ether.src,
                packet.kind,
                packet.channel,
                packet.seq,
                packet.id,
                packet.payload.len()
            ),
            Err(_) => continue,
        }
    }
}
