use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, ResponseCode};
use tracing::{debug, error, warn};

use crate::config::Transport;
use crate::query::QueryDescriptor;
use crate::resolver::{ResolveError, Resolver};

/// Reply side of one inbound request.
#[async_trait]
pub trait ReplyWriter: Send {
    /// Client address, UDP datagram source or TCP peer.
    fn peer(&self) -> SocketAddr;

    async fn write_reply(&mut self, packet: &[u8]) -> io::Result<()>;
}

#[derive(Clone)]
pub struct Handler {
    resolver: Resolver,
}

impl Handler {
    pub fn new(resolver: Resolver) -> Self {
        Self { resolver }
    }

    /// Resolves `request` and writes exactly one reply. The writer is owned by
    /// this call and released when it returns.
    pub async fn handle<W: ReplyWriter>(&self, transport: Transport, mut writer: W, request: Message) {
        let remote = writer.peer().ip();
        let Some(question) = QueryDescriptor::from_message(&request) else {
            debug!(remote = %remote, id = request.id(), "query without question");
            let reply = build_failure(&request, ResponseCode::FormErr);
            self.write_reply_msg(&mut writer, &reply).await;
            return;
        };

        debug!(remote = %remote, question = %question, transport = %transport, "lookup");

        let reply = match self.resolve(transport, &request).await {
            Ok(msg) => msg,
            Err(err) => {
                error!(remote = %remote, question = %question, error = %err, "resolve query error");
                build_failure(&request, ResponseCode::ServFail)
            }
        };
        self.write_reply_msg(&mut writer, &reply).await;
    }

    async fn resolve(&self, transport: Transport, request: &Message) -> Result<Message, ResolveError> {
        let msg = self.resolver.lookup(transport, request).await?;
        if transport == Transport::Udp && msg.truncated() {
            debug!(id = request.id(), "truncated udp answer, retrying over tcp");
            return self.resolver.lookup(Transport::Tcp, request).await;
        }
        Ok(msg)
    }

    async fn write_reply_msg<W: ReplyWriter>(&self, writer: &mut W, msg: &Message) {
        let packet = match msg.to_vec() {
            Ok(packet) => packet,
            Err(err) => {
                warn!(id = msg.id(), error = %err, "encode reply failed");
                return;
            }
        };
        if let Err(err) = writer.write_reply(&packet).await {
            debug!(remote = %writer.peer(), id = msg.id(), error = %err, "write reply failed");
        }
    }
}

/// Reply carrying the identity and first question of `req` with `rcode` and
/// no records.
pub fn build_failure(req: &Message, rcode: ResponseCode) -> Message {
    let mut msg = Message::new();
    msg.set_id(req.id());
    msg.set_message_type(MessageType::Response);
    msg.set_op_code(req.op_code());
    msg.set_recursion_desired(req.recursion_desired());
    msg.set_checking_disabled(req.checking_disabled());
    msg.set_recursion_available(true);
    msg.set_response_code(rcode);
    if let Some(q) = req.queries().first() {
        msg.add_query(q.clone());
    }
    msg
}
