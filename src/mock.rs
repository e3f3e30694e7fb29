//! Simulated upstreams for resolver, handler and listener tests.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, Query, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{Name, RData, Record, RecordType};
use std::str::FromStr;

use crate::config::Transport;
use crate::upstream::Exchange;

#[derive(Debug, Clone)]
pub(crate) enum Behavior {
    /// Respond after `delay`; the answer carries `ip` so tests can tell upstreams apart.
    Answer {
        delay: Duration,
        rcode: ResponseCode,
        truncated: bool,
        ip: Ipv4Addr,
    },
    /// Transport error after `delay`.
    Fail { delay: Duration },
    /// Never respond.
    Hang,
}

impl Behavior {
    pub(crate) fn answer(delay_ms: u64, ip: [u8; 4]) -> Self {
        Behavior::Answer {
            delay: Duration::from_millis(delay_ms),
            rcode: ResponseCode::NoError,
            truncated: false,
            ip: Ipv4Addr::from(ip),
        }
    }

    pub(crate) fn rcode(delay_ms: u64, rcode: ResponseCode) -> Self {
        Behavior::Answer {
            delay: Duration::from_millis(delay_ms),
            rcode,
            truncated: false,
            ip: Ipv4Addr::UNSPECIFIED,
        }
    }

    pub(crate) fn truncated(delay_ms: u64, ip: [u8; 4]) -> Self {
        Behavior::Answer {
            delay: Duration::from_millis(delay_ms),
            rcode: ResponseCode::NoError,
            truncated: true,
            ip: Ipv4Addr::from(ip),
        }
    }

    pub(crate) fn fail(delay_ms: u64) -> Self {
        Behavior::Fail {
            delay: Duration::from_millis(delay_ms),
        }
    }
}

/// Unconfigured (nameserver, transport) pairs hang.
#[derive(Default)]
pub(crate) struct MockExchange {
    behaviors: HashMap<(String, Transport), Behavior>,
    calls: Mutex<Vec<(String, Transport)>>,
}

impl MockExchange {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn on(mut self, nameserver: &str, transport: Transport, behavior: Behavior) -> Self {
        self.behaviors
            .insert((nameserver.to_string(), transport), behavior);
        self
    }

    pub(crate) fn calls(&self) -> Vec<(String, Transport)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Exchange for MockExchange {
    async fn exchange(
        &self,
        request: &Message,
        nameserver: &str,
        transport: Transport,
        _timeout_dur: Duration,
    ) -> anyhow::Result<Message> {
        self.calls
            .lock()
            .unwrap()
            .push((nameserver.to_string(), transport));
        let behavior = self
            .behaviors
            .get(&(nameserver.to_string(), transport))
            .cloned()
            .unwrap_or(Behavior::Hang);
        match behavior {
            Behavior::Answer {
                delay,
                rcode,
                truncated,
                ip,
            } => {
                tokio::time::sleep(delay).await;
                Ok(response_for(request, rcode, truncated, ip))
            }
            Behavior::Fail { delay } => {
                tokio::time::sleep(delay).await;
                anyhow::bail!("connection refused by {nameserver}")
            }
            Behavior::Hang => std::future::pending().await,
        }
    }
}

pub(crate) fn query(name: &str, id: u16) -> Message {
    let mut msg = Message::new();
    msg.set_id(id);
    msg.set_recursion_desired(true);
    msg.add_query(Query::query(Name::from_str(name).unwrap(), RecordType::A));
    msg
}

pub(crate) fn response_for(
    request: &Message,
    rcode: ResponseCode,
    truncated: bool,
    ip: Ipv4Addr,
) -> Message {
    let mut msg = Message::new();
    msg.set_id(request.id());
    msg.set_message_type(MessageType::Response);
    msg.set_recursion_desired(request.recursion_desired());
    msg.set_response_code(rcode);
    msg.set_truncated(truncated);
    msg.add_queries(request.queries().to_vec());
    if rcode == ResponseCode::NoError {
        if let Some(q) = request.queries().first() {
            msg.add_answer(Record::from_rdata(q.name().clone(), 60, RData::A(A(ip))));
        }
    }
    msg
}

/// IPv4 of the first A answer.
pub(crate) fn answer_ip(msg: &Message) -> Option<Ipv4Addr> {
    msg.answers().iter().find_map(|r| match r.data() {
        Some(RData::A(a)) => Some(a.0),
        _ => None,
    })
}
