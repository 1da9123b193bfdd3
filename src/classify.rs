//! Message classification.
//!
//! Tags each decoded message with the transition it should drive. Client
//! queries are recognized by the socket they arrived on; upstream responses
//! are judged against the lookup their transaction id correlates to.

use crate::dns::{Message, MessageKind, Question, RecordType, ResponseCode};
use crate::pending::PendingTable;

/// Socket a message arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Client,
    Upstream,
}

/// What the engine expects from the upstream response correlated by id.
#[derive(Debug, Clone, Copy)]
pub struct Expectation<'a> {
    pub question: &'a Question,
    /// Set when the lookup is resolving an authority's address.
    pub authority: Option<&'a str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// A or PTR query from a client.
    ClientQuery,
    /// Client query of a type this resolver does not serve.
    UnsupportedQuery,
    /// Authority section names the next servers to ask.
    Delegation,
    /// Answer to an address lookup some delegation is parked on.
    NsAddressAnswer,
    /// Answer to a client's own question.
    FinalAnswer,
    /// NXDOMAIN or an empty answer without a referral.
    NegativeAnswer,
    /// Anything else; dropped.
    Unexpected(&'static str),
}

/// Classify `message`, which arrived on `source`.
///
/// `expected` is the lookup the response's transaction id maps to, if any.
/// For responses carrying answers the pending table is consulted before a
/// final answer is assumed.
pub fn classify(
    message: &Message,
    source: Source,
    expected: Option<Expectation<'_>>,
    pending: &PendingTable,
) -> Classification {
    match (source, message.kind) {
        (Source::Client, MessageKind::Query) => classify_query(message),
        (Source::Client, MessageKind::Response) => {
            Classification::Unexpected("response from client")
        }
        (Source::Upstream, MessageKind::Query) => Classification::Unexpected("query from upstream"),
        (Source::Upstream, MessageKind::Response) => match expected {
            Some(expected) => classify_response(message, expected, pending),
            None => Classification::Unexpected("unknown transaction id"),
        },
    }
}

fn classify_query(message: &Message) -> Classification {
    let Some(question) = message.question() else {
        return Classification::Unexpected("query without question");
    };
    if !(message.answers.is_empty()
        && message.authorities.is_empty()
        && message.additionals.is_empty())
    {
        return Classification::Unexpected("query carries records");
    }

    match question.qtype {
        RecordType::A | RecordType::Ptr => Classification::ClientQuery,
        _ => Classification::UnsupportedQuery,
    }
}

fn classify_response(
    message: &Message,
    expected: Expectation<'_>,
    pending: &PendingTable,
) -> Classification {
    match message.question() {
        Some(question) if question.matches(expected.question) => {}
        _ => return Classification::Unexpected("question mismatch"),
    }

    if message.rcode == ResponseCode::NxDomain {
        return Classification::NegativeAnswer;
    }

    if !message.answers.is_empty() {
        let qtype = expected.question.qtype;
        if !message.answers.iter().any(|r| r.rtype == qtype) {
            return Classification::Unexpected("type mismatch");
        }
        return match expected.authority {
            Some(authority) if pending.contains(authority) => Classification::NsAddressAnswer,
            Some(_) => Classification::Unexpected("no delegation waits on this address"),
            None => Classification::FinalAnswer,
        };
    }

    if message.authorities.is_empty() {
        return Classification::Unexpected("empty response");
    }
    if message.authorities.iter().any(|r| r.rtype == RecordType::Ns) {
        Classification::Delegation
    } else {
        Classification::NegativeAnswer
    }
}
