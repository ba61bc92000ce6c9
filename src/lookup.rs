//! Forward, reverse and service lookups on top of any [`Resolver`].

use std::net::IpAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use tracing::debug;

use crate::error::{Error, Result};
use crate::querier::Resolver;
use crate::service_name::ServiceName;

static NEXT_ID: AtomicU16 = AtomicU16::new(0);

/// A fresh non-zero message id.
///
/// mDNS responders answer multicast queries with id 0, so queries never use
/// it; that keeps id-based and content-based correlation apart.
pub fn next_query_id() -> u16 {
    static SEED: OnceLock<u16> = OnceLock::new();
    let seed = *SEED.get_or_init(|| {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| (d.subsec_nanos() ^ std::process::id()) as u16)
            .unwrap_or(1)
    });
    loop {
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed).wrapping_add(seed);
        if id != 0 {
            return id;
        }
    }
}

/// Build a standard query for `name`/`record_type`.
pub fn query_message(name: Name, record_type: RecordType) -> Message {
    let mut message = Message::new();
    message
        .set_id(next_query_id())
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .add_query(Query::query(name, record_type));
    message
}

/// Name used for PTR lookups of `ip` (`in-addr.arpa.` or `ip6.arpa.`).
pub fn reverse_name(ip: IpAddr) -> Result<Name> {
    let text = match ip {
        IpAddr::V4(v4) => {
            let [a, b, c, d] = v4.octets();
            format!("{d}.{c}.{b}.{a}.in-addr.arpa.")
        }
        IpAddr::V6(v6) => {
            let mut text = String::with_capacity(72);
            for byte in v6.octets().iter().rev() {
                text.push_str(&format!("{:x}.{:x}.", byte & 0x0f, byte >> 4));
            }
            text.push_str("ip6.arpa.");
            text
        }
    };
    Ok(Name::from_ascii(&text)?)
}

fn parse_name(text: &str) -> Result<Name> {
    let mut name = Name::from_str(text).map_err(|e| Error::Parse(format!("{text}: {e}")))?;
    name.set_fqdn(true);
    Ok(name)
}

/// Lookup operations over a resolver, typically a
/// [`MulticastDnsQuerier`](crate::querier::MulticastDnsQuerier).
#[derive(Clone)]
pub struct Lookup {
    resolver: Arc<dyn Resolver>,
}

impl Lookup {
    /// Wrap `resolver`.
    pub fn new(resolver: Arc<dyn Resolver>) -> Self {
        Self { resolver }
    }

    /// Records of `record_type` owned by `name`. NXDOMAIN yields an empty list.
    pub fn records(&self, name: &Name, record_type: RecordType) -> Result<Vec<Record>> {
        let response = self
            .resolver
            .send(&query_message(name.clone(), record_type))?;
        if response.response_code() == ResponseCode::NXDomain {
            debug!(%name, ?record_type, "no records");
            return Ok(Vec::new());
        }
        Ok(response
            .answers()
            .iter()
            .filter(|r| {
                r.name() == name
                    && (record_type == RecordType::ANY || r.record_type() == record_type)
            })
            .cloned()
            .collect())
    }

    /// Forward lookup: A and AAAA addresses of `host`.
    pub fn host_addresses(&self, host: &str) -> Result<Vec<IpAddr>> {
        let name = parse_name(host)?;
        let mut addresses = Vec::new();
        for record_type in [RecordType::A, RecordType::AAAA] {
            for record in self.records(&name, record_type)? {
                match record.data() {
                    RData::A(a) => addresses.push(IpAddr::V4(a.0)),
                    RData::AAAA(aaaa) => addresses.push(IpAddr::V6(aaaa.0)),
                    _ => {}
                }
            }
        }
        addresses.dedup();
        Ok(addresses)
    }

    /// Reverse lookup: host names for `ip`.
    pub fn reverse(&self, ip: IpAddr) -> Result<Vec<Name>> {
        let name = reverse_name(ip)?;
        Ok(self
            .records(&name, RecordType::PTR)?
            .into_iter()
            .filter_map(|record| match record.data() {
                RData::PTR(ptr) => Some(ptr.0.clone()),
                _ => None,
            })
            .collect())
    }

    /// Browse: service instances of `service_type`, e.g. `_http._tcp.local.`.
    ///
    /// Pointers that are not valid service instance names are skipped.
    pub fn browse(&self, service_type: &str) -> Result<Vec<ServiceName>> {
        let name = parse_name(service_type)?;
        let mut services = Vec::new();
        for record in self.records(&name, RecordType::PTR)? {
            let RData::PTR(ptr) = record.data() else {
                continue;
            };
            match ServiceName::from_name(&ptr.0) {
                Ok(service) if !services.contains(&service) => services.push(service),
                Ok(_) => {}
                Err(e) => debug!(target = %ptr.0, error = %e, "skipping pointer"),
            }
        }
        Ok(services)
    }
}
