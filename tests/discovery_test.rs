//! End-to-end discovery + handshake + upload + maintenance (S1), and the
//! literal (non-sentinel) announced server IP path (S2).

mod common;

use std::time::Duration;

use reccaster_client::driver::DriverConfig;
use reccaster_client::wire::{self, MSG_ADD_RECORD, MSG_CLIENT_DONE, MSG_CLIENT_GREETING, MSG_CLIENT_PONG, MSG_SERVER_PING};
use reccaster_client::Driver;

use common::*;

#[test]
fn happy_path_discovers_connects_uploads_and_maintains() {
    init_logging();
    let (listener, tcp_port) = bind_test_server();

    let server = std::thread::spawn(move || {
        let mut conn = TestServerConn::accept(&listener);

        let greeting = conn.read_message();
        assert_eq!(greeting.msg_id, MSG_CLIENT_GREETING);
        assert_eq!(&greeting.body[4..8], &0x1234_5678u32.to_be_bytes());

        conn.send(&frame(wire::MSG_SERVER_GREETING, &[1]));

        // Skip past the built-in environment info tags (§6) the driver
        // sends automatically before invoking getRecords; their exact
        // count depends on the host's process environment.
        let add_record = conn.read_until(MSG_ADD_RECORD);
        assert_eq!(&add_record.body[0..4], &1u32.to_be_bytes());
        assert_eq!(add_record.body[4], 0); // rtype = record
        assert_eq!(add_record.body[5], 2); // rtlen = len("ai")
        assert_eq!(&add_record.body[6..8], &3u16.to_be_bytes()); // rnlen = len("X:1")
        assert_eq!(&add_record.body[8..10], b"ai");
        assert_eq!(&add_record.body[10..13], b"X:1");

        let done = conn.read_until(MSG_CLIENT_DONE);
        assert_eq!(done.body, vec![0, 0, 0, 0]);

        let nonce = 0x1020_3040u32.to_be_bytes();
        conn.send(&frame(MSG_SERVER_PING, &nonce));

        let pong = conn.read_message();
        assert_eq!(pong.msg_id, MSG_CLIENT_PONG);
        assert_eq!(pong.body, nonce);

        conn.close();
    });

    let mut driver = Driver::builder()
        .driver_config(DriverConfig { timeout: Duration::from_secs(3), max_holdoff: Duration::from_millis(20), udp_port: 0 })
        .get_records(|uploader, _config| {
            uploader.send_record("ai", "X:1")?;
            Ok(())
        })
        .start()
        .unwrap();

    let udp_port = wait_for(Duration::from_secs(2), || driver.udp_port());
    send_announcement(loopback(udp_port), wire::SERVER_IP_USE_SOURCE, tcp_port, 0x1234_5678);

    server.join().unwrap();
    driver.shutdown();
}

#[test]
fn literal_server_ip_is_honored_verbatim() {
    init_logging();
    let (listener, tcp_port) = bind_test_server();

    let server = std::thread::spawn(move || {
        let mut conn = TestServerConn::accept(&listener);
        let _greeting = conn.read_message();
        conn.send(&frame(wire::MSG_SERVER_GREETING, &[1]));
        let _done = conn.read_until(MSG_CLIENT_DONE);
        conn.close();
    });

    let mut driver = Driver::builder()
        .driver_config(DriverConfig { timeout: Duration::from_secs(3), max_holdoff: Duration::from_millis(20), udp_port: 0 })
        .get_records(|_uploader, _config| Ok(()))
        .start()
        .unwrap();

    let udp_port = wait_for(Duration::from_secs(2), || driver.udp_port());
    // 127.0.0.1 encoded literally (not the 0xFFFFFFFF sentinel); loopback
    // can't spoof a different source, but this still pins the "take the
    // announced IP verbatim" path rather than the substitution path.
    let literal_ip = u32::from(std::net::Ipv4Addr::LOCALHOST);
    send_announcement(loopback(udp_port), literal_ip, tcp_port, 0xdead_beef);

    server.join().unwrap();
    driver.shutdown();
}
