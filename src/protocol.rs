//! Request Envelope wire codec.
//!
//! The envelope is the small self-describing payload that accompanies the
//! descriptor set in one `sendmsg` call:
//!
//! ```text
//! [u8: version] [u8: init flag] [u8: service]
//! [u16 LE: target_len] [target bytes…]
//! [u16 LE: command_len] [command bytes…]
//! ```
//!
//! Built once by the Client Connector, consumed exactly once by the
//! dispatcher, and required to round-trip byte-for-byte.

use anyhow::{anyhow, bail, Result};

/// Wire format version byte.
const VERSION: u8 = 1;

/// What the caller is asking the broker for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    /// No service: reserved; a decoded request carrying it is refused by
    /// the dispatcher.
    None,
    /// Interactive session or remote command over the shared connection.
    Connect,
    /// Raw TCP tunnel dialed through the shared connection.
    Forward,
}

impl Service {
    fn to_wire(self) -> u8 {
        match self {
            Service::None => 0,
            Service::Connect => 1,
            Service::Forward => 2,
        }
    }

    fn from_wire(b: u8) -> Result<Self> {
        match b {
            0 => Ok(Service::None),
            1 => Ok(Service::Connect),
            2 => Ok(Service::Forward),
            other => bail!("unknown service byte: 0x{other:02x}"),
        }
    }
}

/// The request descriptor sent alongside the descriptor set.
///
/// Immutable once built. `command` is only meaningful for
/// [`Service::Connect`] (empty means interactive shell); `dial_target` only
/// for [`Service::Forward`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// True for the gated initialization connection itself.
    pub init: bool,
    /// Requested service.
    pub service: Service,
    /// `host:port` to dial through the shared connection (Forward only).
    pub dial_target: String,
    /// Remote command to execute (Connect only; empty = shell).
    pub command: String,
}

impl Request {
    /// A Connect request. Empty `command` means an interactive shell.
    pub fn connect(command: impl Into<String>, init: bool) -> Self {
        Self {
            init,
            service: Service::Connect,
            dial_target: String::new(),
            command: command.into(),
        }
    }

    /// A Forward request for `host:port`.
    pub fn forward(dial_target: impl Into<String>) -> Self {
        Self {
            init: false,
            service: Service::Forward,
            dial_target: dial_target.into(),
            command: String::new(),
        }
    }

    /// Encode to wire bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let target = self.dial_target.as_bytes();
        let command = self.command.as_bytes();
        if target.len() > u16::MAX as usize {
            bail!("dial target too long: {} bytes", target.len());
        }
        if command.len() > u16::MAX as usize {
            bail!("command too long: {} bytes", command.len());
        }

        let mut buf = Vec::with_capacity(3 + 2 + target.len() + 2 + command.len());
        buf.push(VERSION);
        buf.push(u8::from(self.init));
        buf.push(self.service.to_wire());
        buf.extend_from_slice(&(target.len() as u16).to_le_bytes());
        buf.extend_from_slice(target);
        buf.extend_from_slice(&(command.len() as u16).to_le_bytes());
        buf.extend_from_slice(command);
        Ok(buf)
    }

    /// Decode from wire bytes. Strict: trailing garbage is an error.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.len() < 3 {
            bail!("request envelope too short: {} bytes", payload.len());
        }
        if payload[0] != VERSION {
            bail!("unsupported envelope version: {}", payload[0]);
        }
        let init = match payload[1] {
            0 => false,
            1 => true,
            other => bail!("invalid init flag byte: 0x{other:02x}"),
        };
        let service = Service::from_wire(payload[2])?;

        let mut off = 3;
        let dial_target = take_string(payload, &mut off).map_err(|e| anyhow!("dial target: {e}"))?;
        let command = take_string(payload, &mut off).map_err(|e| anyhow!("command: {e}"))?;
        if off != payload.len() {
            bail!("trailing bytes after envelope: {}", payload.len() - off);
        }

        Ok(Self { init, service, dial_target, command })
    }
}

fn take_string(payload: &[u8], off: &mut usize) -> Result<String> {
    if payload.len() < *off + 2 {
        bail!("truncated length prefix");
    }
    let len = u16::from_le_bytes([payload[*off], payload[*off + 1]]) as usize;
    *off += 2;
    if payload.len() < *off + len {
        bail!("truncated body: want {len} bytes, have {}", payload.len() - *off);
    }
    let s = std::str::from_utf8(&payload[*off..*off + len])
        .map_err(|e| anyhow!("not UTF-8: {e}"))?
        .to_owned();
    *off += len;
    Ok(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_round_trip() {
        let req = Request::connect("echo hi", false);
        let decoded = Request::decode(&req.encode().unwrap()).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn shell_round_trip_keeps_empty_command() {
        let req = Request::connect("", true);
        let bytes = req.encode().unwrap();
        let decoded = Request::decode(&bytes).unwrap();
        assert_eq!(decoded, req);
        assert!(decoded.command.is_empty());
        // Byte-stability: re-encoding yields identical bytes.
        assert_eq!(decoded.encode().unwrap(), bytes);
    }

    #[test]
    fn forward_round_trip() {
        let req = Request::forward("db.internal:5432");
        let decoded = Request::decode(&req.encode().unwrap()).unwrap();
        assert_eq!(decoded, req);
        assert_eq!(decoded.service, Service::Forward);
    }

    #[test]
    fn truncation_is_an_error_at_every_boundary() {
        let bytes = Request::connect("ls -la", false).encode().unwrap();
        for cut in 0..bytes.len() {
            assert!(
                Request::decode(&bytes[..cut]).is_err(),
                "decode of {cut}-byte prefix should fail"
            );
        }
    }

    #[test]
    fn trailing_garbage_rejected() {
        let mut bytes = Request::forward("h:1").encode().unwrap();
        bytes.push(0xff);
        assert!(Request::decode(&bytes).is_err());
    }

    #[test]
    fn bad_version_and_bad_service_rejected() {
        let mut bytes = Request::connect("", false).encode().unwrap();
        bytes[0] = 9;
        assert!(Request::decode(&bytes).is_err());

        let mut bytes = Request::connect("", false).encode().unwrap();
        bytes[2] = 7;
        assert!(Request::decode(&bytes).is_err());
    }
}
