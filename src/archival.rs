//! Conversion of saver events into the shared measurement schema.

use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::errorx::{Failure, Operation};
use crate::trace::Event;

/// Binary blob in the schema's `{"format": "base64", "data": ...}` form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinaryData {
    pub format: String,
    pub data: String,
}

impl BinaryData {
    pub fn new(bytes: &[u8]) -> Self {
        Self {
            format: "base64".to_string(),
            data: STANDARD.encode(bytes),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DnsAnswerEntry {
    pub answer_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipv4: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipv6: Option<String>,
    pub ttl: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DnsQueryEntry {
    pub answers: Vec<DnsAnswerEntry>,
    pub dial_id: Option<u64>,
    pub engine: String,
    pub failure: Option<Failure>,
    pub hostname: String,
    pub query_type: String,
    pub resolver_address: String,
    pub t: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TcpConnectStatus {
    pub failure: Option<Failure>,
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TcpConnectEntry {
    pub dial_id: Option<u64>,
    pub ip: String,
    pub port: u16,
    pub status: TcpConnectStatus,
    pub t: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TlsHandshake {
    pub cipher_suite: String,
    pub dial_id: Option<u64>,
    pub failure: Option<Failure>,
    pub negotiated_protocol: String,
    pub no_tls_verify: bool,
    pub peer_certificates: Vec<BinaryData>,
    pub server_name: String,
    pub t: f64,
    pub tls_version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkEvent {
    pub address: Option<String>,
    pub conn_id: Option<u64>,
    /// Bytes read or written; absent for other operations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<BinaryData>,
    pub dial_id: Option<u64>,
    pub failure: Option<Failure>,
    pub num_bytes: Option<usize>,
    pub operation: Operation,
    pub proto: Option<String>,
    pub t: f64,
}

/// Seconds from `begin` to the end of `event`.
fn relative_time(begin: Instant, event: &Event) -> f64 {
    event.finished().saturating_duration_since(begin).as_secs_f64()
}

/// One `A` and one `AAAA` entry per `resolve` event.
pub fn new_dns_queries_list(begin: Instant, events: &[Event]) -> Vec<DnsQueryEntry> {
    let mut out = Vec::new();
    for event in events.iter().filter(|e| e.operation == Operation::Resolve) {
        for query_type in ["A", "AAAA"] {
            let answers = event
                .addresses
                .iter()
                .filter_map(|addr| addr.parse::<IpAddr>().ok())
                .filter_map(|ip| match (query_type, ip) {
                    ("A", IpAddr::V4(v4)) => Some(DnsAnswerEntry {
                        answer_type: "A".to_string(),
                        ipv4: Some(v4.to_string()),
                        ipv6: None,
                        ttl: None,
                    }),
                    ("AAAA", IpAddr::V6(v6)) => Some(DnsAnswerEntry {
                        answer_type: "AAAA".to_string(),
                        ipv4: None,
                        ipv6: Some(v6.to_string()),
                        ttl: None,
                    }),
                    _ => None,
                })
                .collect();
            out.push(DnsQueryEntry {
                answers,
                dial_id: event.dial_id,
                engine: event.proto.unwrap_or("system").to_string(),
                failure: event.failure.clone(),
                hostname: event.hostname.clone().unwrap_or_default(),
                query_type: query_type.to_string(),
                resolver_address: event.address.clone().unwrap_or_default(),
                t: relative_time(begin, event),
            });
        }
    }
    out
}

pub fn new_tcp_connect_list(begin: Instant, events: &[Event]) -> Vec<TcpConnectEntry> {
    events
        .iter()
        .filter(|e| e.operation == Operation::Connect && e.proto == Some("tcp"))
        .filter_map(|event| {
            let addr: SocketAddr = event.address.as_deref()?.parse().ok()?;
            Some(TcpConnectEntry {
                dial_id: event.dial_id,
                ip: addr.ip().to_string(),
                port: addr.port(),
                status: TcpConnectStatus {
                    failure: event.failure.clone(),
                    success: event.failure.is_none(),
                },
                t: relative_time(begin, event),
            })
        })
        .collect()
}

/// Both TLS-over-TCP and QUIC handshakes.
pub fn new_tls_handshakes_list(begin: Instant, events: &[Event]) -> Vec<TlsHandshake> {
    events
        .iter()
        .filter(|e| matches!(e.operation, Operation::TlsHandshake | Operation::QuicHandshake))
        .map(|event| {
            let state = event.tls.clone().unwrap_or_default();
            TlsHandshake {
                cipher_suite: state.cipher_suite,
                dial_id: event.dial_id,
                failure: event.failure.clone(),
                negotiated_protocol: state.negotiated_protocol,
                no_tls_verify: false,
                peer_certificates: state
                    .peer_certificates
                    .iter()
                    .map(|der| BinaryData::new(der))
                    .collect(),
                server_name: state.server_name,
                t: relative_time(begin, event),
                tls_version: state.version,
            }
        })
        .collect()
}

/// Every event in completion order. Reads and writes keep their bytes.
pub fn new_network_events_list(begin: Instant, events: &[Event]) -> Vec<NetworkEvent> {
    events
        .iter()
        .map(|event| NetworkEvent {
            address: event.address.clone(),
            conn_id: event.conn_id,
            data: match event.operation {
                Operation::Read | Operation::Write => {
                    event.data.as_deref().map(BinaryData::new)
                }
                _ => None,
            },
            dial_id: event.dial_id,
            failure: event.failure.clone(),
            num_bytes: match event.operation {
                Operation::Read | Operation::Write => Some(event.num_bytes),
                _ => None,
            },
            operation: event.operation,
            proto: event.proto.map(str::to_string),
            t: relative_time(begin, event),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::TlsState;
    use std::time::Duration;

    fn event(operation: Operation, begin: Instant, after_ms: u64) -> Event {
        let mut event = Event::new(operation, begin + Duration::from_millis(after_ms));
        event.duration = Duration::from_millis(5);
        event
    }

    #[test]
    fn resolve_splits_into_a_and_aaaa() {
        let begin = Instant::now();
        let mut resolve = event(Operation::Resolve, begin, 10);
        resolve.hostname = Some("example.com".into());
        resolve.proto = Some("system");
        resolve.addresses = vec!["93.184.216.34".into(), "2606:2800:220:1::1".into()];

        let queries = new_dns_queries_list(begin, &[resolve]);
        assert_eq!(queries.len(), 2);
        assert_eq!(queries[0].query_type, "A");
        assert_eq!(queries[0].answers[0].ipv4.as_deref(), Some("93.184.216.34"));
        assert_eq!(queries[1].query_type, "AAAA");
        assert_eq!(queries[1].answers[0].ipv6.as_deref(), Some("2606:2800:220:1::1"));
        assert_eq!(queries[0].engine, "system");
        assert!((queries[0].t - 0.015).abs() < 1e-6);
    }

    #[test]
    fn connect_entries_carry_ip_port_and_status() {
        let begin = Instant::now();
        let mut ok = event(Operation::Connect, begin, 0);
        ok.proto = Some("tcp");
        ok.address = Some("[::1]:443".into());
        let mut refused = event(Operation::Connect, begin, 1);
        refused.proto = Some("tcp");
        refused.address = Some("127.0.0.1:443".into());
        refused.failure = Some(Failure::CONNECTION_REFUSED);

        let entries = new_tcp_connect_list(begin, &[ok, refused]);
        assert_eq!(entries[0].ip, "::1");
        assert_eq!(entries[0].port, 443);
        assert!(entries[0].status.success);
        assert!(!entries[1].status.success);
        assert_eq!(entries[1].status.failure, Some(Failure::CONNECTION_REFUSED));
    }

    #[test]
    fn handshake_certificates_are_base64() {
        let begin = Instant::now();
        let mut handshake = event(Operation::TlsHandshake, begin, 0);
        handshake.tls = Some(TlsState {
            server_name: "example.com".into(),
            version: "TLSv1.3".into(),
            cipher_suite: "TLS_AES_128_GCM_SHA256".into(),
            negotiated_protocol: String::new(),
            peer_certificates: vec![vec![0xde, 0xad, 0xbe, 0xef]],
        });
        let list = new_tls_handshakes_list(begin, &[handshake]);
        assert_eq!(list[0].peer_certificates[0].data, "3q2+7w==");
        assert_eq!(list[0].server_name, "example.com");

        let json = serde_json::to_value(&list[0]).unwrap();
        assert_eq!(json["peer_certificates"][0]["format"], "base64");
        assert_eq!(json["tls_version"], "TLSv1.3");
    }

    #[test]
    fn network_events_keep_order_and_read_write_bytes() {
        let begin = Instant::now();
        let connect = event(Operation::Connect, begin, 0);
        let mut write = event(Operation::Write, begin, 1);
        write.num_bytes = 4;
        write.data = Some(vec![0xde, 0xad, 0xbe, 0xef]);
        let list = new_network_events_list(begin, &[connect, write]);
        assert_eq!(list[0].operation, Operation::Connect);
        assert_eq!(list[0].num_bytes, None);
        assert_eq!(list[0].data, None);
        assert_eq!(list[1].num_bytes, Some(4));
        assert_eq!(list[1].data.as_ref().unwrap().data, "3q2+7w==");
        let json = serde_json::to_value(&list).unwrap();
        assert_eq!(json[1]["operation"], "write");
        assert_eq!(json[1]["data"]["format"], "base64");
        assert!(json[0].get("data").is_none());
    }
}
