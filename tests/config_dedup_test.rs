//! Config list dedup through the public builder (S5) and exclusion-glob
//! driven record enumeration (S6), exercised end to end: a getRecords
//! callback that skips excluded names and only uploads the rest.

mod common;

use std::time::Duration;

use reccaster_client::driver::DriverConfig;
use reccaster_client::wire::{self, MSG_ADD_RECORD, MSG_CLIENT_DONE};
use reccaster_client::Driver;

use common::*;

#[test]
fn exclusion_globs_filter_record_enumeration_end_to_end() {
    init_logging();
    let (listener, tcp_port) = bind_test_server();

    let server = std::thread::spawn(move || {
        let mut conn = TestServerConn::accept(&listener);
        let _greeting = conn.read_message();
        conn.send(&frame(wire::MSG_SERVER_GREETING, &[0]));

        let mut uploaded = Vec::new();
        loop {
            let msg = conn.read_message();
            if msg.msg_id == MSG_CLIENT_DONE {
                break;
            }
            if msg.msg_id == MSG_ADD_RECORD {
                let rnlen = u16::from_be_bytes([msg.body[6], msg.body[7]]) as usize;
                let rtlen = msg.body[5] as usize;
                let name_start = 8 + rtlen;
                uploaded.push(String::from_utf8(msg.body[name_start..name_start + rnlen].to_vec()).unwrap());
            }
        }
        conn.close();
        uploaded
    });

    let mut driver = Driver::builder()
        .driver_config(DriverConfig { timeout: Duration::from_secs(3), max_holdoff: Duration::from_millis(20), udp_port: 0 })
        .add_exclude_patterns(["TEST:*", "*_"])
        .get_records(|uploader, config| {
            for name in ["X:1", "TEST:foo", "bar_", "baz"] {
                if !config.is_excluded(name) {
                    uploader.send_record("ai", name)?;
                }
            }
            Ok(())
        })
        .start()
        .unwrap();

    let udp_port = wait_for(Duration::from_secs(2), || driver.udp_port());
    send_announcement(loopback(udp_port), wire::SERVER_IP_USE_SOURCE, tcp_port, 1);

    let uploaded = server.join().unwrap();
    assert_eq!(uploaded, vec!["X:1".to_string(), "baz".to_string()]);

    driver.shutdown();
}

#[test]
fn env_var_extras_are_visible_to_get_records_via_config() {
    init_logging();

    let driver = Driver::builder()
        .driver_config(DriverConfig { timeout: Duration::from_secs(3), max_holdoff: Duration::from_millis(20), udp_port: 0 })
        .add_env_vars(["SECTOR"])
        .add_env_vars(["SECTOR", "BUILDING"]) // "SECTOR" is a duplicate, dropped
        .get_records(|_uploader, _config| Ok(()))
        .start()
        .unwrap();

    let extras: Vec<&String> = driver
        .config()
        .env_vars()
        .iter()
        .filter(|name| *name == "SECTOR" || *name == "BUILDING")
        .collect();
    assert_eq!(extras, vec!["SECTOR", "BUILDING"]);

    drop(driver);
}
