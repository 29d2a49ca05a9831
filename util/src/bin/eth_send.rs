use clap::{App, Arg};
use linkchat::net::frame::{self, encode_app, Channel, Kind, TransferId};
use linkchat::{LinkSocket, MacAddr};

fn main() {
    let matches = App::new("eth_send")
        .about("Sends one text message as a raw Ethernet frame")
        .arg(Arg::with_name("interface").required(true))
        .arg(Arg::with_name("message").required(true))
        .arg(
            Arg::with_name("dest")
                .long("dest")
                .takes_value(true)
                .help("Destination MAC, broadcast when omitted"),
        )
        .get_matches();

    let interface = matches.value_of("interface").unwrap();
    let message = matches.value_of("message").unwrap();
    let dest: MacAddr = matches
        .value_of("dest")
        .unwrap_or("ff:ff:ff:ff:ff:ff")
        .parse()
        .expect("Invalid destination MAC");

    let socket = LinkSocket::open(interface).expect("Error opening raw socket (run as root)");

    let data = encode_app(Kind::Msg, Channel::Chat, 0, &TransferId::NIL, message.as_bytes())
        .expect("Error encoding frame");

    let sent = socket
        .send_frame(dest, frame::ETHERTYPE, &data)
        .expect("Error sending frame");

    println!("sent {} bytes to {} via {}", sent, dest, interface);
}
