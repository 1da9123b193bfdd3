//! DNS message model shared by the codec, the engine and the responder.
//!
//! Names are stored lowercased without the trailing root dot. Record data is
//! kept as text: the dotted IPv4 address for A records and the target
//! hostname for NS, CNAME and PTR records.

use std::net::Ipv4Addr;
use std::ops::BitOr;

/// The IN class, the only class this resolver deals with.
pub const CLASS_IN: u16 = 1;

/// Record and question types the resolver understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordType {
    A,
    Ns,
    Cname,
    Ptr,
    Other(u16),
}

impl RecordType {
    pub fn code(self) -> u16 {
        match self {
            RecordType::A => 1,
            RecordType::Ns => 2,
            RecordType::Cname => 5,
            RecordType::Ptr => 12,
            RecordType::Other(code) => code,
        }
    }

    pub fn from_code(code: u16) -> Self {
        match code {
            1 => RecordType::A,
            2 => RecordType::Ns,
            5 => RecordType::Cname,
            12 => RecordType::Ptr,
            other => RecordType::Other(other),
        }
    }
}

/// Whether a message asks or answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Query,
    Response,
}

/// Header flag bits, using their positions in the wire header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flags(u16);

impl Flags {
    pub const NONE: Flags = Flags(0);
    pub const AUTHORITATIVE_ANSWER: Flags = Flags(1 << 10);
    pub const RECURSION_DESIRED: Flags = Flags(1 << 8);
    pub const RECURSION_AVAILABLE: Flags = Flags(1 << 7);

    pub fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn bits(self) -> u16 {
        self.0
    }
}

impl BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResponseCode {
    #[default]
    NoError,
    FormErr,
    ServFail,
    NxDomain,
    NotImp,
    Refused,
    Other(u16),
}

/// A question section entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub name: String,
    pub qtype: RecordType,
    pub qclass: u16,
}

impl Question {
    pub fn new(name: &str, qtype: RecordType) -> Self {
        Self {
            name: normalize_name(name),
            qtype,
            qclass: CLASS_IN,
        }
    }

    /// Same name (case-insensitive) and type.
    pub fn matches(&self, other: &Question) -> bool {
        self.qtype == other.qtype && self.name.eq_ignore_ascii_case(&other.name)
    }
}

/// A resource record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub name: String,
    pub rtype: RecordType,
    pub class: u16,
    pub ttl: u32,
    pub data: String,
}

impl Record {
    pub fn new(name: &str, rtype: RecordType, ttl: u32, data: &str) -> Self {
        Self {
            name: normalize_name(name),
            rtype,
            class: CLASS_IN,
            ttl,
            data: data.to_string(),
        }
    }

    /// The address carried by an A record.
    pub fn ipv4(&self) -> Option<Ipv4Addr> {
        match self.rtype {
            RecordType::A => self.data.parse().ok(),
            _ => None,
        }
    }
}

/// A decoded DNS message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: u16,
    pub kind: MessageKind,
    pub flags: Flags,
    pub rcode: ResponseCode,
    pub questions: Vec<Question>,
    pub answers: Vec<Record>,
    pub authorities: Vec<Record>,
    pub additionals: Vec<Record>,
}

impl Message {
    /// A query carrying a single question.
    pub fn query(id: u16, flags: Flags, question: Question) -> Self {
        Self {
            id,
            kind: MessageKind::Query,
            flags,
            rcode: ResponseCode::NoError,
            questions: vec![question],
            answers: Vec::new(),
            authorities: Vec::new(),
            additionals: Vec::new(),
        }
    }

    /// A response to `questions` with the given answer section.
    pub fn response(id: u16, flags: Flags, questions: Vec<Question>, answers: Vec<Record>) -> Self {
        Self {
            id,
            kind: MessageKind::Response,
            flags,
            rcode: ResponseCode::NoError,
            questions,
            answers,
            authorities: Vec::new(),
            additionals: Vec::new(),
        }
    }

    pub fn question(&self) -> Option<&Question> {
        self.questions.first()
    }
}

/// Lowercase a domain name and strip the trailing root dot.
pub fn normalize_name(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}
