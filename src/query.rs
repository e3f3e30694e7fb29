use std::fmt;

use hickory_proto::op::Message;

/// Identity of an inbound question, used for logging only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryDescriptor {
    pub name: String,
    pub qtype: String,
    pub qclass: String,
}

impl QueryDescriptor {
    /// Built from the first question; `None` when the message carries none.
    pub fn from_message(msg: &Message) -> Option<Self> {
        let q = msg.queries().first()?;
        Some(Self {
            name: un_fqdn(&q.name().to_string()).to_string(),
            qtype: q.query_type().to_string(),
            qclass: q.query_class().to_string(),
        })
    }
}

impl fmt::Display for QueryDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.name, self.qclass, self.qtype)
    }
}

#[inline]
pub fn un_fqdn(name: &str) -> &str {
    match name.strip_suffix('.') {
        Some(stripped) if !stripped.is_empty() => stripped,
        _ => name,
    }
}
