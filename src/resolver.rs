use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::{Message, ResponseCode};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::Transport;
use crate::query::un_fqdn;
use crate::upstream::Exchange;

/// No configured nameserver produced a usable answer.
#[derive(Debug, Clone, Error)]
#[error("{qname} resolv failed on {} ({transport})", .nameservers.join("; "))]
pub struct ResolveError {
    pub qname: String,
    pub transport: Transport,
    pub nameservers: Vec<String>,
}

/// Races the configured nameservers in priority order.
///
/// Each nameserver is queried from its own task. After launching one, the
/// lookup waits up to `stagger` for any attempt to publish an answer before
/// launching the next; the first attempt to complete wins. Losing attempts
/// are not cancelled, they run until their own timeout and their results
/// are dropped.
#[derive(Clone)]
pub struct Resolver {
    nameservers: Arc<[String]>,
    exchange: Arc<dyn Exchange>,
    attempt_timeout: Duration,
    stagger: Duration,
}

impl Resolver {
    pub fn new(
        nameservers: Vec<String>,
        exchange: Arc<dyn Exchange>,
        attempt_timeout: Duration,
        stagger: Duration,
    ) -> Self {
        Self {
            nameservers: nameservers.into(),
            exchange,
            attempt_timeout,
            stagger,
        }
    }

    pub fn nameservers(&self) -> &[String] {
        &self.nameservers
    }

    /// Only the first question of `request` is considered.
    pub async fn lookup(
        &self,
        transport: Transport,
        request: &Message,
    ) -> Result<Message, ResolveError> {
        let qname = request
            .queries()
            .first()
            .map(|q| q.name().to_string())
            .unwrap_or_default();
        let request = Arc::new(request.clone());
        // single slot: the first published answer is kept, later ones are dropped
        let (slot, mut winner) = mpsc::channel::<Message>(1);
        let mut attempts = Vec::with_capacity(self.nameservers.len());

        for nameserver in self.nameservers.iter() {
            attempts.push(self.spawn_attempt(
                transport,
                nameserver.clone(),
                Arc::clone(&request),
                slot.clone(),
            ));
            if let Ok(Some(answer)) = timeout(self.stagger, winner.recv()).await {
                return Ok(answer);
            }
        }

        drop(slot);
        for attempt in attempts {
            if let Err(err) = attempt.await {
                warn!(qname = %qname, error = %err, "lookup attempt task failed");
            }
        }

        winner.try_recv().map_err(|_| ResolveError {
            qname,
            transport,
            nameservers: self.nameservers.to_vec(),
        })
    }

    fn spawn_attempt(
        &self,
        transport: Transport,
        nameserver: String,
        request: Arc<Message>,
        slot: mpsc::Sender<Message>,
    ) -> JoinHandle<()> {
        let exchange = Arc::clone(&self.exchange);
        let attempt_timeout = self.attempt_timeout;
        tokio::spawn(async move {
            let qname = request
                .queries()
                .first()
                .map(|q| q.name().to_string())
                .unwrap_or_default();
            let exchanged = timeout(
                attempt_timeout,
                exchange.exchange(&request, &nameserver, transport, attempt_timeout),
            )
            .await;
            let response = match exchanged {
                Ok(Ok(response)) => response,
                Ok(Err(err)) => {
                    warn!(qname = %qname, nameserver = %nameserver, transport = %transport, error = %err, "socket error on nameserver");
                    return;
                }
                Err(_) => {
                    warn!(qname = %qname, nameserver = %nameserver, transport = %transport, timeout_ms = attempt_timeout.as_millis() as u64, "nameserver timed out");
                    return;
                }
            };

            match response.response_code() {
                ResponseCode::NoError => {
                    debug!(qname = %un_fqdn(&qname), nameserver = %nameserver, transport = %transport, "resolv");
                }
                ResponseCode::ServFail => {
                    debug!(qname = %qname, nameserver = %nameserver, "server failure from nameserver, ignoring answer");
                    return;
                }
                rcode => {
                    debug!(qname = %qname, nameserver = %nameserver, rcode = ?rcode, "failed to get a valid answer");
                }
            }
            // full or closed slot: another attempt already won
            let _ = slot.try_send(response);
        })
    }
}
