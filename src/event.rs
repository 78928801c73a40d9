use std::fmt::{self, Write as _};
use std::net::SocketAddr;

use chrono::{DateTime, Utc};

use crate::encoding::encode;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

#[derive(Debug, Clone, Copy)]
pub enum EventKind<'a> {
    Open,
    Close,
    Data(&'a [u8]),
}

/// One captured moment of a connection, rendered as a single NDJSON line.
///
/// Field order is fixed: `time`, `ConnID`, then `event` or `data`, then `from` and `to`.
#[derive(Debug, Clone, Copy)]
pub struct TraceEvent<'a> {
    pub time: DateTime<Utc>,
    pub conn_id: &'a str,
    pub kind: EventKind<'a>,
    pub from: &'a str,
    pub to: &'a str,
}

impl<'a> TraceEvent<'a> {
    pub fn now(conn_id: &'a str, kind: EventKind<'a>, from: &'a str, to: &'a str) -> Self {
        Self {
            time: Utc::now(),
            conn_id,
            kind,
            from,
            to,
        }
    }

    /// The rendered record including its trailing newline.
    pub fn to_line(&self) -> String {
        let payload = match self.kind {
            EventKind::Data(bytes) => bytes.len() * 2,
            _ => 0,
        };
        let mut line = String::with_capacity(128 + payload);
        // Writing into a String cannot fail.
        let _ = writeln!(line, "{self}");
        line
    }
}

impl fmt::Display for TraceEvent<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{\"time\":\"{}\",\"ConnID\":\"{}\",",
            format_timestamp(&self.time),
            self.conn_id
        )?;
        match self.kind {
            EventKind::Open => f.write_str("\"event\":\"open\",")?,
            EventKind::Close => f.write_str("\"event\":\"close\",")?,
            EventKind::Data(bytes) => write!(f, "\"data\":\"{}\",", encode(bytes))?,
        }
        write!(f, "\"from\":\"{}\",\"to\":\"{}\"}}", self.from, self.to)
    }
}

pub fn format_timestamp(time: &DateTime<Utc>) -> String {
    time.format(TIMESTAMP_FORMAT).to_string()
}

/// `host:port` with IPv6 hosts bracketed.
pub fn format_addr(addr: &SocketAddr) -> String {
    match addr {
        SocketAddr::V4(v4) => format!("{}:{}", v4.ip(), v4.port()),
        SocketAddr::V6(v6) => format!("[{}]:{}", v6.ip(), v6.port()),
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn fixed_time() -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_234_567_890_123).unwrap()
    }

    #[test]
    fn timestamp_has_microsecond_precision() {
        assert_eq!(
            format_timestamp(&fixed_time()),
            "2009-02-13T23:31:30.123000Z"
        );
    }

    #[test]
    fn open_line_field_order() {
        let event = TraceEvent {
            time: fixed_time(),
            conn_id: "0ABcd",
            kind: EventKind::Open,
            from: "127.0.0.1:50123",
            to: "example.com:80",
        };
        assert_eq!(
            event.to_line(),
            "{\"time\":\"2009-02-13T23:31:30.123000Z\",\"ConnID\":\"0ABcd\",\"event\":\"open\",\"from\":\"127.0.0.1:50123\",\"to\":\"example.com:80\"}\n"
        );
    }

    #[test]
    fn close_line_field_order() {
        let event = TraceEvent {
            time: fixed_time(),
            conn_id: "0ABcd",
            kind: EventKind::Close,
            from: "example.com:80",
            to: "127.0.0.1:50123",
        };
        assert_eq!(
            event.to_string(),
            "{\"time\":\"2009-02-13T23:31:30.123000Z\",\"ConnID\":\"0ABcd\",\"event\":\"close\",\"from\":\"example.com:80\",\"to\":\"127.0.0.1:50123\"}"
        );
    }

    #[test]
    fn data_line_is_valid_json() {
        let payload = b"GET / HTTP/1.1\r\nHost: \"x\"\r\n\r\n\x00\xff100%";
        let event = TraceEvent {
            time: fixed_time(),
            conn_id: "00001",
            kind: EventKind::Data(payload),
            from: "[::1]:4000",
            to: "example.com:80",
        };
        let line = event.to_line();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);

        let value: serde_json::Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(value["ConnID"], "00001");
        assert_eq!(value["from"], "[::1]:4000");
        assert_eq!(
            value["data"],
            "GET / HTTP/1.1\r\nHost: \"x\"\r\n\r\n%00%FF100%25"
        );
        assert!(value.get("event").is_none());
        assert!(line.starts_with("{\"time\":"));
        assert!(line.contains("\"ConnID\":\"00001\",\"data\":"));
    }

    #[test]
    fn addresses_bracket_ipv6() {
        let v4: SocketAddr = "10.0.0.1:8080".parse().unwrap();
        let v6: SocketAddr = "[fe80::1]:443".parse().unwrap();
        assert_eq!(format_addr(&v4), "10.0.0.1:8080");
        assert_eq!(format_addr(&v6), "[fe80::1]:443");
    }
}
