//! Wire codec: converts between raw datagrams and [`Message`].
//!
//! Parsing and serialization are delegated to `hickory-proto`; this module
//! only maps its message model onto ours. Records of types other than A, NS,
//! CNAME and PTR are decoded with their presentation text for inspection but
//! are not written back out.

use std::net::Ipv4Addr;

use hickory_proto::op::{
    Message as WireMessage, MessageType, OpCode, Query, ResponseCode as WireCode,
};
use hickory_proto::rr::rdata::{A, CNAME, NS, PTR};
use hickory_proto::rr::{Name, RData, Record as WireRecord, RecordType as WireType};
use tracing::trace;

use crate::dns::{
    Flags, Message, MessageKind, Question, Record, RecordType, ResponseCode, normalize_name,
};
use crate::error::{Error, Result};

/// Decode a datagram into a [`Message`].
pub fn decode(bytes: &[u8]) -> Result<Message> {
    let wire = WireMessage::from_vec(bytes).map_err(|e| Error::DecodeFailure(e.to_string()))?;

    let mut flags = Flags::NONE;
    if wire.authoritative() {
        flags = flags | Flags::AUTHORITATIVE_ANSWER;
    }
    if wire.recursion_desired() {
        flags = flags | Flags::RECURSION_DESIRED;
    }
    if wire.recursion_available() {
        flags = flags | Flags::RECURSION_AVAILABLE;
    }

    let questions = wire
        .queries()
        .iter()
        .map(|q| Question {
            name: name_text(q.name()),
            qtype: RecordType::from_code(u16::from(q.query_type())),
            qclass: u16::from(q.query_class()),
        })
        .collect();

    Ok(Message {
        id: wire.id(),
        kind: match wire.message_type() {
            MessageType::Query => MessageKind::Query,
            MessageType::Response => MessageKind::Response,
        },
        flags,
        rcode: from_wire_code(wire.response_code()),
        questions,
        answers: decode_records(wire.answers()),
        authorities: decode_records(wire.name_servers()),
        additionals: decode_records(wire.additionals()),
    })
}

/// Encode a [`Message`] into a datagram.
pub fn encode(message: &Message) -> Result<Vec<u8>> {
    let mut wire = WireMessage::new();
    wire.set_id(message.id);
    wire.set_message_type(match message.kind {
        MessageKind::Query => MessageType::Query,
        MessageKind::Response => MessageType::Response,
    });
    wire.set_op_code(OpCode::Query);
    wire.set_authoritative(message.flags.contains(Flags::AUTHORITATIVE_ANSWER));
    wire.set_recursion_desired(message.flags.contains(Flags::RECURSION_DESIRED));
    wire.set_recursion_available(message.flags.contains(Flags::RECURSION_AVAILABLE));
    wire.set_response_code(to_wire_code(message.rcode));

    for question in &message.questions {
        let qtype = WireType::from(question.qtype.code());
        wire.add_query(Query::query(wire_name(&question.name)?, qtype));
    }
    for record in &message.answers {
        if let Some(record) = encode_record(record)? {
            wire.add_answer(record);
        }
    }
    for record in &message.authorities {
        if let Some(record) = encode_record(record)? {
            wire.add_name_server(record);
        }
    }
    for record in &message.additionals {
        if let Some(record) = encode_record(record)? {
            wire.add_additional(record);
        }
    }

    wire.to_vec().map_err(|e| Error::EncodeFailure(e.to_string()))
}

fn decode_records(records: &[WireRecord]) -> Vec<Record> {
    records.iter().filter_map(decode_record).collect()
}

fn decode_record(record: &WireRecord) -> Option<Record> {
    let data = match record.data() {
        Some(RData::A(a)) => a.0.to_string(),
        Some(RData::NS(ns)) => name_text(&ns.0),
        Some(RData::CNAME(cname)) => name_text(&cname.0),
        Some(RData::PTR(ptr)) => name_text(&ptr.0),
        Some(other) => other.to_string(),
        None => {
            trace!(name = %record.name(), "skipping record without data");
            return None;
        }
    };

    Some(Record {
        name: name_text(record.name()),
        rtype: RecordType::from_code(u16::from(record.record_type())),
        class: u16::from(record.dns_class()),
        ttl: record.ttl(),
        data,
    })
}

fn encode_record(record: &Record) -> Result<Option<WireRecord>> {
    let rdata = match record.rtype {
        RecordType::A => {
            let ip: Ipv4Addr = record.data.parse().map_err(|_| {
                Error::EncodeFailure(format!("invalid IPv4 address '{}'", record.data))
            })?;
            RData::A(A(ip))
        }
        RecordType::Ns => RData::NS(NS(wire_name(&record.data)?)),
        RecordType::Cname => RData::CNAME(CNAME(wire_name(&record.data)?)),
        RecordType::Ptr => RData::PTR(PTR(wire_name(&record.data)?)),
        RecordType::Other(code) => {
            trace!(name = %record.name, rtype = code, "not encoding unsupported record");
            return Ok(None);
        }
    };

    Ok(Some(WireRecord::from_rdata(
        wire_name(&record.name)?,
        record.ttl,
        rdata,
    )))
}

fn name_text(name: &Name) -> String {
    normalize_name(&name.to_ascii())
}

fn wire_name(name: &str) -> Result<Name> {
    let fqdn = if name.ends_with('.') {
        name.to_string()
    } else {
        format!("{name}.")
    };
    Name::from_ascii(&fqdn).map_err(|e| Error::EncodeFailure(format!("invalid name '{name}': {e}")))
}

fn from_wire_code(code: WireCode) -> ResponseCode {
    match code {
        WireCode::NoError => ResponseCode::NoError,
        WireCode::FormErr => ResponseCode::FormErr,
        WireCode::ServFail => ResponseCode::ServFail,
        WireCode::NXDomain => ResponseCode::NxDomain,
        WireCode::NotImp => ResponseCode::NotImp,
        WireCode::Refused => ResponseCode::Refused,
        other => ResponseCode::Other(u16::from(other)),
    }
}

fn to_wire_code(code: ResponseCode) -> WireCode {
    match code {
        ResponseCode::NoError => WireCode::NoError,
        ResponseCode::FormErr => WireCode::FormErr,
        ResponseCode::ServFail => WireCode::ServFail,
        ResponseCode::NxDomain => WireCode::NXDomain,
        ResponseCode::NotImp => WireCode::NotImp,
        ResponseCode::Refused => WireCode::Refused,
        ResponseCode::Other(value) => WireCode::Unknown(value),
    }
}
