//! Upload-phase protocol operations: records, aliases, and info tags.
//!
//! A [`CatalogUploader`] wraps the TCP [`InterruptibleSocket`] installed
//! for the current cycle and the record-id counter carried by
//! [`crate::driver::DriverState`]. It is handed to the host's
//! `getRecords` callback for the duration of the upload phase only.

use anyhow::{bail, Context, Result};

use crate::config::Config;
use crate::socket::InterruptibleSocket;
use crate::wire;

/// Value sent in the fixed `EPICS_VERSION` info tag that always leads the
/// environment-metadata upload (§6).
pub const EPICS_VERSION_TAG: &str = env!("CARGO_PKG_VERSION");

/// Name length ceilings from the wire format: `rtlen`/`klen` are 8-bit
/// fields, `rnlen`/`vlen` are 16-bit fields.
pub const MAX_SHORT_NAME_LEN: usize = 255;
pub const MAX_LONG_NAME_LEN: usize = 65535;

/// Issues upload-phase messages over the cycle's TCP connection and
/// allocates record ids from a signed, monotonically increasing counter.
///
/// `next_rec_id` going negative is a terminal "id space exhausted"
/// sentinel: once negative, every further `send_record` call fails
/// without touching the wire.
pub struct CatalogUploader<'a> {
    sock: &'a mut InterruptibleSocket,
    next_rec_id: &'a mut i64,
}

impl<'a> CatalogUploader<'a> {
    pub fn new(sock: &'a mut InterruptibleSocket, next_rec_id: &'a mut i64) -> Self {
        Self { sock, next_rec_id }
    }

    /// Allocate a new record id and announce a record with the given type
    /// and instance name. Returns the allocated rid.
    pub fn send_record(&mut self, rtype_name: &str, instance_name: &str) -> Result<i64> {
        if *self.next_rec_id < 0 {
            bail!("record id space exhausted, refusing to allocate");
        }
        check_short_name("record type", rtype_name)?;
        check_long_name("record instance name", instance_name)?;

        let rid = *self.next_rec_id;
        let msg = wire::add_record(rid as u32, 0, rtype_name.as_bytes(), instance_name.as_bytes());
        self.send(&msg).context("sending add-record message")?;

        *self.next_rec_id = self.next_rec_id.checked_add(1).unwrap_or(-1);
        Ok(rid)
    }

    /// Announce an additional name bound to an already-uploaded record.
    /// Aliases always carry an empty record-type name.
    pub fn send_alias(&mut self, rid: i64, alias_name: &str) -> Result<()> {
        check_long_name("alias name", alias_name)?;
        let msg = wire::add_record(rid as u32, 1, b"", alias_name.as_bytes());
        self.send(&msg).context("sending add-alias message")
    }

    /// Attach a key/value info tag. `rid = 0` means "about the process
    /// itself", not a specific record.
    pub fn send_info(&mut self, rid: i64, key: &str, value: &str) -> Result<()> {
        check_short_name("info key", key)?;
        check_long_name("info value", value)?;
        let msg = wire::add_info(rid as u32, key.as_bytes(), value.as_bytes());
        self.send(&msg).context("sending add-info message")
    }

    /// Send the built-in environment-metadata info tags (§6): a fixed
    /// `EPICS_VERSION` tag first, then every configured env-var name, in
    /// order, whose value is present and non-empty in the process
    /// environment. `HOSTNAME` is synthesized from the OS host name first
    /// if it is unset or empty, so it always has a value to report.
    pub fn send_default_env_tags(&mut self, config: &Config) -> Result<()> {
        ensure_hostname_env();
        self.send_info(0, "EPICS_VERSION", EPICS_VERSION_TAG)?;
        for name in config.env_vars() {
            if let Ok(value) = std::env::var(name) {
                if !value.is_empty() {
                    self.send_info(0, name, &value)?;
                }
            }
        }
        Ok(())
    }

    fn send(&mut self, msg: &[u8]) -> Result<()> {
        let sent = self.sock.send_all(msg).context("writing to upload socket")?;
        if !sent {
            bail!("connection lost mid-send");
        }
        Ok(())
    }
}

/// Query the OS host name and inject it as `HOSTNAME` if that variable is
/// currently unset or empty in the process environment.
fn ensure_hostname_env() {
    let unset = std::env::var("HOSTNAME").map(|v| v.is_empty()).unwrap_or(true);
    if !unset {
        return;
    }
    match hostname::get() {
        Ok(name) => match name.into_string() {
            Ok(name) => std::env::set_var("HOSTNAME", name),
            Err(_) => log::warn!("OS host name is not valid UTF-8, leaving HOSTNAME unset"),
        },
        Err(e) => log::warn!("could not query OS host name: {e}"),
    }
}

fn check_short_name(field: &str, value: &str) -> Result<()> {
    if value.len() > MAX_SHORT_NAME_LEN {
        bail!("{field} exceeds {MAX_SHORT_NAME_LEN} bytes: {} bytes given", value.len());
    }
    Ok(())
}

fn check_long_name(field: &str, value: &str) -> Result<()> {
    if value.len() > MAX_LONG_NAME_LEN {
        bail!("{field} exceeds {MAX_LONG_NAME_LEN} bytes: {} bytes given", value.len());
    }
    Ok(())
}
