//! Outgoing message construction and delivery.
//!
//! The engine decides, the responder builds the message and hands the
//! encoded bytes to the right socket.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::codec;
use crate::dns::{Flags, Message, Question, Record, ResponseCode};
use crate::error::Result;
use crate::resolver::ClientContext;

/// TTL of the synthesized PTR answer.
pub const PTR_TTL: u32 = 3600;
/// Data of the synthesized PTR answer.
pub const PTR_HOSTNAME: &str = "localhost";

/// A message the engine wants sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    /// Response to a client, sent from the listening socket.
    Reply { to: SocketAddr, message: Message },
    /// Query to an upstream server, sent from the upstream socket.
    Query { to: SocketAddr, message: Message },
}

impl Outgoing {
    pub fn destination(&self) -> SocketAddr {
        match self {
            Outgoing::Reply { to, .. } | Outgoing::Query { to, .. } => *to,
        }
    }

    pub fn message(&self) -> &Message {
        match self {
            Outgoing::Reply { message, .. } | Outgoing::Query { message, .. } => message,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        codec::encode(self.message())
    }
}

/// Authoritative answer for the client's original question.
pub fn reply_to_client(context: &ClientContext, answers: Vec<Record>) -> Outgoing {
    Outgoing::Reply {
        to: context.client,
        message: Message::response(
            context.transaction_id,
            Flags::AUTHORITATIVE_ANSWER,
            vec![context.question.clone()],
            answers,
        ),
    }
}

/// Answer-less reply carrying only a response code.
pub fn reply_with_code(context: &ClientContext, rcode: ResponseCode) -> Outgoing {
    let mut message = Message::response(
        context.transaction_id,
        Flags::RECURSION_AVAILABLE,
        vec![context.question.clone()],
        Vec::new(),
    );
    message.rcode = rcode;
    Outgoing::Reply {
        to: context.client,
        message,
    }
}

/// Relays an upstream negative answer with its authority section.
pub fn reply_negative(
    context: &ClientContext,
    rcode: ResponseCode,
    authorities: Vec<Record>,
) -> Outgoing {
    let mut out = reply_with_code(context, rcode);
    if let Outgoing::Reply { message, .. } = &mut out {
        message.authorities = authorities;
    }
    out
}

/// The fixed `localhost` answer to a PTR query.
pub fn reply_ptr(context: &ClientContext) -> Outgoing {
    let answer = Record::new(
        &context.question.name,
        context.question.qtype,
        PTR_TTL,
        PTR_HOSTNAME,
    );
    reply_to_client(context, vec![answer])
}

/// A recursion-desired query for `question` to `address`.
pub fn query_upstream(address: SocketAddr, question: &Question, transaction_id: u16) -> Outgoing {
    Outgoing::Query {
        to: address,
        message: Message::query(transaction_id, Flags::RECURSION_DESIRED, question.clone()),
    }
}

/// Sends encoded messages on the client-facing and upstream sockets.
pub struct Responder {
    socket: Arc<UdpSocket>,
    upstream: Arc<UdpSocket>,
}

impl Responder {
    pub fn new(socket: Arc<UdpSocket>, upstream: Arc<UdpSocket>) -> Self {
        Self { socket, upstream }
    }

    /// Encode and send. Failures are logged; the message is dropped.
    pub async fn send(&self, outgoing: &Outgoing) {
        let bytes = match outgoing.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, to = %outgoing.destination(), "dropping unencodable message");
                return;
            }
        };

        let (socket, direction) = match outgoing {
            Outgoing::Reply { .. } => (&self.socket, "reply"),
            Outgoing::Query { .. } => (&self.upstream, "query"),
        };

        match socket.send_to(&bytes, outgoing.destination()).await {
            Ok(_) => debug!(to = %outgoing.destination(), direction, len = bytes.len(), "sent"),
            Err(e) => warn!(error = %e, to = %outgoing.destination(), direction, "UDP send error"),
        }
    }
}
