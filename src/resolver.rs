//! Resolution engine.
//!
//! Drives every client query through the delegation chain:
//! 1. PTR queries are answered locally
//! 2. A queries are answered from cache when possible
//! 3. Otherwise the question goes to the root and each referral is followed,
//!    using glue when present and a separate address lookup when not
//!
//! All per-query state lives in tables keyed by id, so any number of
//! resolutions can overlap. The engine never touches sockets or clocks:
//! transports feed it decoded messages and the current time, and send the
//! [`Outgoing`] messages it returns.

use rustc_hash::FxHashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::cache::{CacheConfig, DnsCache};
use crate::classify::{Classification, Expectation, Source, classify};
use crate::dns::{Message, Question, Record, RecordType, ResponseCode, normalize_name};
use crate::error::Error;
use crate::pending::{PendingTable, Waiter};
use crate::responder::{self, Outgoing};
use crate::stats::Stats;

/// Identifies one client resolution.
pub type ResolutionId = u64;
/// Identifies one upstream lookup chain within a resolution.
pub type LookupId = u64;

/// Default root server (a.root-servers.net).
pub const DEFAULT_ROOT: Ipv4Addr = Ipv4Addr::new(198, 41, 0, 4);

/// Resolver settings.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Root server queried for every fresh lookup.
    pub root: SocketAddr,
    /// Port used when querying authorities learned from referrals.
    pub upstream_port: u16,
    /// Deadline for a whole resolution.
    pub timeout: Duration,
    /// Referrals a resolution may follow before it is abandoned.
    pub max_hops: u8,
    /// Concurrent resolutions before new cache misses are refused.
    pub max_resolutions: usize,
    /// Reply SERVFAIL when a resolution is abandoned.
    pub servfail_on_failure: bool,
    pub cache: CacheConfig,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            root: SocketAddr::new(IpAddr::V4(DEFAULT_ROOT), 53),
            upstream_port: 53,
            timeout: Duration::from_secs(5),
            max_hops: 10,
            max_resolutions: 4096,
            servfail_on_failure: true,
            cache: CacheConfig::default(),
        }
    }
}

/// Who asked, and what.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientContext {
    pub transaction_id: u16,
    pub client: SocketAddr,
    pub question: Question,
}

/// Progress of a client's own lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionState {
    AwaitingRoot,
    AwaitingDelegationAddr,
    AwaitingFinal,
}

struct Resolution {
    context: ClientContext,
    state: ResolutionState,
    hops_left: u8,
    started: Instant,
    deadline: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Target {
    /// The client's question.
    Client,
    /// The address of the named authority.
    Authority(String),
}

struct Lookup {
    resolution: ResolutionId,
    question: Question,
    target: Target,
    /// Transaction id of the query currently in flight, if any.
    upstream_id: Option<u16>,
    /// Server that query was sent to.
    server: Option<SocketAddr>,
}

/// The resolution state machine. Owns the cache and the pending table.
pub struct Resolver {
    config: ResolverConfig,
    cache: DnsCache,
    pending: PendingTable,
    resolutions: FxHashMap<ResolutionId, Resolution>,
    lookups: FxHashMap<LookupId, Lookup>,
    /// Upstream transaction id -> lookup awaiting that response.
    in_flight: FxHashMap<u16, LookupId>,
    next_id: u64,
    stats: Arc<Stats>,
}

impl Resolver {
    pub fn new(config: ResolverConfig, stats: Arc<Stats>) -> Self {
        Self {
            cache: DnsCache::new(config.cache.clone()),
            config,
            pending: PendingTable::new(),
            resolutions: FxHashMap::default(),
            lookups: FxHashMap::default(),
            in_flight: FxHashMap::default(),
            next_id: 0,
            stats,
        }
    }

    /// Process one decoded message that arrived on `source` from `from`.
    ///
    /// Returns the messages to send, in order.
    pub fn handle(
        &mut self,
        message: Message,
        source: Source,
        from: SocketAddr,
        now: Instant,
    ) -> Vec<Outgoing> {
        let expected = match source {
            Source::Client => None,
            Source::Upstream => {
                let lookup = self
                    .in_flight
                    .get(&message.id)
                    .and_then(|id| self.lookups.get(id));
                match lookup {
                    Some(lookup) if lookup.server != Some(from) => {
                        debug!(
                            id = message.id,
                            from = %from,
                            expected = ?lookup.server,
                            "dropping response from unexpected source"
                        );
                        return Vec::new();
                    }
                    lookup => lookup.map(|lookup| Expectation {
                        question: &lookup.question,
                        authority: match &lookup.target {
                            Target::Authority(name) => Some(name.as_str()),
                            Target::Client => None,
                        },
                    }),
                }
            }
        };

        let classification = classify(&message, source, expected, &self.pending);

        match classification {
            Classification::ClientQuery => return self.on_client_query(message, from, now),
            Classification::UnsupportedQuery => return self.on_unsupported(message, from),
            Classification::Unexpected(reason) => {
                debug!(id = message.id, from = %from, reason, "dropping message");
                return Vec::new();
            }
            _ => {}
        }

        let Some(lookup_id) = self.in_flight.remove(&message.id) else {
            return Vec::new();
        };
        if let Some(lookup) = self.lookups.get_mut(&lookup_id) {
            lookup.upstream_id = None;
            lookup.server = None;
        }

        match classification {
            Classification::Delegation => self.on_delegation(lookup_id, &message, now),
            Classification::NsAddressAnswer => self.on_ns_address(lookup_id, &message, now),
            Classification::FinalAnswer => self.on_final_answer(lookup_id, message, now),
            Classification::NegativeAnswer => self.on_negative_answer(lookup_id, &message, now),
            _ => Vec::new(),
        }
    }

    /// Abandon resolutions past their deadline and drop expired cache entries.
    pub fn sweep(&mut self, now: Instant) -> Vec<Outgoing> {
        let expired: Vec<ResolutionId> = self
            .resolutions
            .iter()
            .filter(|(_, r)| now >= r.deadline)
            .map(|(id, _)| *id)
            .collect();

        let mut out = Vec::new();
        for id in expired {
            out.extend(self.fail(id, Error::Timeout, now));
        }

        let removed = self.cache.sweep(now);
        if removed > 0 {
            debug!(removed, "expired cache entries removed");
        }
        self.stats.set_gauges(self.cache.len(), self.resolutions.len());
        out
    }

    /// Number of resolutions in progress.
    pub fn in_flight(&self) -> usize {
        self.resolutions.len()
    }

    /// Number of authorities with an address lookup in progress.
    pub fn pending_delegations(&self) -> usize {
        self.pending.len()
    }

    pub fn cache(&self) -> &DnsCache {
        &self.cache
    }

    /// State of the resolution started by `client` with `transaction_id`.
    pub fn state_of(&self, client: SocketAddr, transaction_id: u16) -> Option<ResolutionState> {
        self.resolutions
            .values()
            .find(|r| r.context.client == client && r.context.transaction_id == transaction_id)
            .map(|r| r.state)
    }

    fn on_client_query(
        &mut self,
        message: Message,
        from: SocketAddr,
        now: Instant,
    ) -> Vec<Outgoing> {
        let Some(question) = message.questions.into_iter().next() else {
            return Vec::new();
        };
        let context = ClientContext {
            transaction_id: message.id,
            client: from,
            question,
        };

        if context.question.qtype == RecordType::Ptr {
            debug!(domain = %context.question.name, client = %from, "PTR answered locally");
            self.stats.record_ptr(0.0);
            return vec![responder::reply_ptr(&context)];
        }

        if let Some(records) = self.cache.lookup(
            &context.question.name,
            context.question.qtype,
            now,
        ) {
            debug!(domain = %context.question.name, client = %from, "CACHED");
            self.stats.record_cached(0.0);
            return vec![responder::reply_to_client(&context, records)];
        }

        if self.resolutions.values().any(|r| r.context == context) {
            debug!(
                domain = %context.question.name,
                client = %from,
                "retransmitted query already in flight"
            );
            return Vec::new();
        }

        if self.resolutions.len() >= self.config.max_resolutions {
            warn!(
                domain = %context.question.name,
                client = %from,
                "too many resolutions in flight"
            );
            self.stats.record_failed(0.0);
            return vec![responder::reply_with_code(&context, ResponseCode::ServFail)];
        }

        let resolution_id = self.allocate_id();
        let question = context.question.clone();
        debug!(
            domain = %question.name,
            client = %from,
            resolution = resolution_id,
            "resolving from root"
        );
        self.resolutions.insert(
            resolution_id,
            Resolution {
                context,
                state: ResolutionState::AwaitingRoot,
                hops_left: self.config.max_hops,
                started: now,
                deadline: now + self.config.timeout,
            },
        );

        let lookup_id = self.start_lookup(resolution_id, question, Target::Client);
        self.send_lookup(lookup_id, self.config.root, now)
    }

    fn on_unsupported(&mut self, message: Message, from: SocketAddr) -> Vec<Outgoing> {
        let Some(question) = message.questions.into_iter().next() else {
            return Vec::new();
        };
        debug!(
            domain = %question.name,
            qtype = ?question.qtype,
            client = %from,
            "unsupported query type"
        );
        let context = ClientContext {
            transaction_id: message.id,
            client: from,
            question,
        };
        vec![responder::reply_with_code(&context, ResponseCode::NotImp)]
    }

    fn on_delegation(
        &mut self,
        lookup_id: LookupId,
        message: &Message,
        now: Instant,
    ) -> Vec<Outgoing> {
        let Some(lookup) = self.lookups.get(&lookup_id) else {
            return Vec::new();
        };
        let resolution_id = lookup.resolution;
        let is_client = lookup.target == Target::Client;
        let looking_for = match &lookup.target {
            Target::Authority(name) => Some(name.clone()),
            Target::Client => None,
        };
        let zone_question = lookup.question.name.clone();

        let Some(authority) = message
            .authorities
            .iter()
            .find(|r| r.rtype == RecordType::Ns)
            .map(|r| normalize_name(&r.data))
        else {
            return Vec::new();
        };

        let Some(resolution) = self.resolutions.get_mut(&resolution_id) else {
            return Vec::new();
        };
        if resolution.hops_left == 0 {
            return self.fail(resolution_id, Error::UnresolvableDelegation(zone_question), now);
        }
        resolution.hops_left -= 1;

        let glue = message
            .additionals
            .iter()
            .filter(|r| r.rtype == RecordType::A && r.name.eq_ignore_ascii_case(&authority))
            .find_map(Record::ipv4);
        let address = glue.or_else(|| {
            self.cache
                .lookup(&authority, RecordType::A, now)
                .and_then(|records| records.iter().find_map(Record::ipv4))
        });

        if let Some(ip) = address {
            debug!(
                domain = %zone_question,
                authority = %authority,
                address = %ip,
                "following referral"
            );
            if is_client {
                if let Some(resolution) = self.resolutions.get_mut(&resolution_id) {
                    resolution.state = ResolutionState::AwaitingFinal;
                }
            }
            let target = SocketAddr::new(IpAddr::V4(ip), self.config.upstream_port);
            return self.send_lookup(lookup_id, target, now);
        }

        if looking_for.as_deref() == Some(authority.as_str()) {
            return self.fail(resolution_id, Error::UnresolvableDelegation(authority), now);
        }

        debug!(domain = %zone_question, authority = %authority, "referral without glue");
        if is_client {
            if let Some(resolution) = self.resolutions.get_mut(&resolution_id) {
                resolution.state = ResolutionState::AwaitingDelegationAddr;
            }
        }
        self.park(
            authority,
            Waiter {
                lookup: lookup_id,
                resolution: resolution_id,
            },
            now,
        )
    }

    fn on_ns_address(
        &mut self,
        lookup_id: LookupId,
        message: &Message,
        now: Instant,
    ) -> Vec<Outgoing> {
        let Some(lookup) = self.lookups.get(&lookup_id) else {
            return Vec::new();
        };
        let Target::Authority(authority) = lookup.target.clone() else {
            return Vec::new();
        };
        if !self.pending.is_resolved_by(&authority, lookup_id) {
            debug!(authority = %authority, "address answer from a superseded lookup");
            return Vec::new();
        }
        let Some(ip) = message.answers.iter().find_map(Record::ipv4) else {
            return Vec::new();
        };

        self.lookups.remove(&lookup_id);
        if !self.cache.contains(&authority, RecordType::A, now) {
            let records = message
                .answers
                .iter()
                .filter(|r| r.rtype == RecordType::A)
                .cloned()
                .collect();
            self.cache.store(&authority, RecordType::A, records, now);
        }

        let Some(entry) = self.pending.resolve_pending(&authority) else {
            return Vec::new();
        };
        debug!(
            authority = %authority,
            address = %ip,
            waiters = entry.waiters.len(),
            "authority address learned"
        );

        let target = SocketAddr::new(IpAddr::V4(ip), self.config.upstream_port);
        let mut out = Vec::new();
        for waiter in entry.waiters {
            let is_client = self
                .lookups
                .get(&waiter.lookup)
                .is_some_and(|l| l.target == Target::Client);
            if is_client {
                if let Some(resolution) = self.resolutions.get_mut(&waiter.resolution) {
                    resolution.state = ResolutionState::AwaitingFinal;
                }
            }
            out.extend(self.send_lookup(waiter.lookup, target, now));
        }
        out
    }

    fn on_final_answer(
        &mut self,
        lookup_id: LookupId,
        message: Message,
        now: Instant,
    ) -> Vec<Outgoing> {
        let Some(resolution_id) = self.lookups.get(&lookup_id).map(|l| l.resolution) else {
            return Vec::new();
        };
        let Some(resolution) = self.resolutions.get(&resolution_id) else {
            return Vec::new();
        };
        let question = &resolution.context.question;

        if self.cache.contains(&question.name, question.qtype, now) {
            debug!(domain = %question.name, "already cached, keeping first answer");
        } else {
            self.cache
                .store(&question.name, question.qtype, message.answers.clone(), now);
        }

        let elapsed = elapsed_ms(resolution.started, now);
        info!(
            domain = %question.name,
            client = %resolution.context.client,
            answers = message.answers.len(),
            total_ms = elapsed,
            "RESOLVED"
        );
        self.stats.record_resolved(elapsed);

        let mut out = vec![responder::reply_to_client(&resolution.context, message.answers)];
        out.extend(self.finish(resolution_id, now));
        out
    }

    fn on_negative_answer(
        &mut self,
        lookup_id: LookupId,
        message: &Message,
        now: Instant,
    ) -> Vec<Outgoing> {
        let Some(lookup) = self.lookups.get(&lookup_id) else {
            return Vec::new();
        };
        let resolution_id = lookup.resolution;

        match lookup.target.clone() {
            Target::Client => {
                let Some(resolution) = self.resolutions.get(&resolution_id) else {
                    return Vec::new();
                };
                let elapsed = elapsed_ms(resolution.started, now);
                info!(
                    domain = %resolution.context.question.name,
                    client = %resolution.context.client,
                    rcode = ?message.rcode,
                    total_ms = elapsed,
                    "NEGATIVE"
                );
                self.stats.record_resolved(elapsed);
                let mut out = vec![responder::reply_negative(
                    &resolution.context,
                    message.rcode,
                    message.authorities.clone(),
                )];
                out.extend(self.finish(resolution_id, now));
                out
            }
            Target::Authority(authority) => {
                self.lookups.remove(&lookup_id);
                let mut affected = vec![resolution_id];
                if let Some(entry) = self.pending.resolve_pending(&authority) {
                    for waiter in entry.waiters {
                        if !affected.contains(&waiter.resolution) {
                            affected.push(waiter.resolution);
                        }
                    }
                }

                let mut out = Vec::new();
                for id in affected {
                    let error = Error::UnresolvableDelegation(authority.clone());
                    out.extend(self.fail(id, error, now));
                }
                out
            }
        }
    }

    /// Park `waiter` until `authority`'s address is known, starting the
    /// address lookup unless one is already running.
    fn park(&mut self, authority: String, waiter: Waiter, now: Instant) -> Vec<Outgoing> {
        let lookup_id = self.allocate_id();
        match self
            .pending
            .mark_pending(&authority, lookup_id, waiter.resolution, waiter)
        {
            Ok(()) => {
                let question = Question::new(&authority, RecordType::A);
                let lookup_id = self.insert_lookup(
                    lookup_id,
                    waiter.resolution,
                    question,
                    Target::Authority(authority),
                );
                self.send_lookup(lookup_id, self.config.root, now)
            }
            Err(e) => {
                debug!(reason = %e, "queued behind pending address lookup");
                self.pending.enqueue(&authority, waiter);
                Vec::new()
            }
        }
    }

    /// Abandon a resolution, replying SERVFAIL if configured.
    fn fail(&mut self, resolution_id: ResolutionId, error: Error, now: Instant) -> Vec<Outgoing> {
        let Some(resolution) = self.resolutions.get(&resolution_id) else {
            return Vec::new();
        };
        let elapsed = elapsed_ms(resolution.started, now);
        warn!(
            domain = %resolution.context.question.name,
            client = %resolution.context.client,
            error = %error,
            total_ms = elapsed,
            "resolution abandoned"
        );
        self.stats.record_failed(elapsed);

        let mut out = Vec::new();
        if self.config.servfail_on_failure {
            out.push(responder::reply_with_code(
                &resolution.context,
                ResponseCode::ServFail,
            ));
        }
        out.extend(self.finish(resolution_id, now));
        out
    }

    /// Drop all state of a finished resolution. Lookups of other
    /// resolutions that were parked on its address lookups are restarted.
    fn finish(&mut self, resolution_id: ResolutionId, now: Instant) -> Vec<Outgoing> {
        self.resolutions.remove(&resolution_id);

        let in_flight = &mut self.in_flight;
        self.lookups.retain(|_, lookup| {
            if lookup.resolution != resolution_id {
                return true;
            }
            if let Some(id) = lookup.upstream_id {
                in_flight.remove(&id);
            }
            false
        });

        let mut out = Vec::new();
        for (authority, waiter) in self.pending.clear(resolution_id) {
            if self.lookups.contains_key(&waiter.lookup) {
                out.extend(self.park(authority, waiter, now));
            }
        }
        out
    }

    fn start_lookup(
        &mut self,
        resolution: ResolutionId,
        question: Question,
        target: Target,
    ) -> LookupId {
        let id = self.allocate_id();
        self.insert_lookup(id, resolution, question, target)
    }

    fn insert_lookup(
        &mut self,
        id: LookupId,
        resolution: ResolutionId,
        question: Question,
        target: Target,
    ) -> LookupId {
        self.lookups.insert(
            id,
            Lookup {
                resolution,
                question,
                target,
                upstream_id: None,
                server: None,
            },
        );
        id
    }

    /// Query `address` for the lookup's question under a fresh transaction id.
    ///
    /// Fails the owning resolution when no transaction id is free.
    fn send_lookup(
        &mut self,
        lookup_id: LookupId,
        address: SocketAddr,
        now: Instant,
    ) -> Vec<Outgoing> {
        let Some(resolution_id) = self.lookups.get(&lookup_id).map(|l| l.resolution) else {
            return Vec::new();
        };
        let Some(upstream_id) = self.fresh_upstream_id() else {
            return self.fail(resolution_id, Error::IdsExhausted, now);
        };
        let Some(lookup) = self.lookups.get_mut(&lookup_id) else {
            return Vec::new();
        };
        if let Some(previous) = lookup.upstream_id.replace(upstream_id) {
            self.in_flight.remove(&previous);
        }
        lookup.server = Some(address);
        self.in_flight.insert(upstream_id, lookup_id);
        vec![responder::query_upstream(address, &lookup.question, upstream_id)]
    }

    /// A transaction id not used by any query in flight, probed from a
    /// random starting point.
    fn fresh_upstream_id(&self) -> Option<u16> {
        let start = rand::random::<u16>();
        (0..=u16::MAX)
            .map(|offset| start.wrapping_add(offset))
            .find(|id| !self.in_flight.contains_key(id))
    }

    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

fn elapsed_ms(since: Instant, now: Instant) -> f64 {
    now.saturating_duration_since(since).as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use crate::dns::{Flags, MessageKind};

    fn resolver() -> Resolver {
        Resolver::new(ResolverConfig::default(), Arc::new(Stats::new()))
    }

    fn root() -> SocketAddr {
        "198.41.0.4:53".parse().unwrap()
    }

    fn client(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn a_query(id: u16, name: &str) -> Message {
        Message::query(id, Flags::RECURSION_DESIRED, Question::new(name, RecordType::A))
    }

    /// The single upstream query in `out`, with its destination.
    fn sent_query(out: &[Outgoing]) -> (SocketAddr, Message) {
        assert_eq!(out.len(), 1, "expected one outgoing message, got {out:?}");
        match &out[0] {
            Outgoing::Query { to, message } => (*to, message.clone()),
            other => panic!("expected a query, got {other:?}"),
        }
    }

    /// The single client reply in `out`, with its destination.
    fn sent_reply(out: &[Outgoing]) -> (SocketAddr, Message) {
        assert_eq!(out.len(), 1, "expected one outgoing message, got {out:?}");
        match &out[0] {
            Outgoing::Reply { to, message } => (*to, message.clone()),
            other => panic!("expected a reply, got {other:?}"),
        }
    }

    fn referral(query: &Message, zone: &str, ns_host: &str, glue: Option<&str>) -> Message {
        let mut message = Message::response(
            query.id,
            Flags::NONE,
            query.questions.clone(),
            Vec::new(),
        );
        message.authorities = vec![Record::new(zone, RecordType::Ns, 172800, ns_host)];
        if let Some(ip) = glue {
            message.additionals = vec![Record::new(ns_host, RecordType::A, 172800, ip)];
        }
        message
    }

    fn answer(query: &Message, ip: &str, ttl: u32) -> Message {
        let name = &query.questions[0].name;
        Message::response(
            query.id,
            Flags::AUTHORITATIVE_ANSWER,
            query.questions.clone(),
            vec![Record::new(name, RecordType::A, ttl, ip)],
        )
    }

    /// Resolve `name` for `from` through one glued referral.
    fn resolve_via_glue(
        resolver: &mut Resolver,
        from: SocketAddr,
        id: u16,
        name: &str,
        ip: &str,
        ttl: u32,
        now: Instant,
    ) -> Message {
        let out = resolver.handle(a_query(id, name), Source::Client, from, now);
        let (to, query) = sent_query(&out);
        assert_eq!(to, root());

        let out = resolver.handle(
            referral(&query, "test", "ns.test", Some("192.0.2.53")),
            Source::Upstream,
            to,
            now,
        );
        let (to, query) = sent_query(&out);
        assert_eq!(to, "192.0.2.53:53".parse().unwrap());

        let out = resolver.handle(answer(&query, ip, ttl), Source::Upstream, to, now);
        let (to, reply) = sent_reply(&out);
        assert_eq!(to, from);
        reply
    }

    #[test]
    fn ptr_query_is_answered_locally() {
        let mut resolver = resolver();
        let query = Message::query(
            9,
            Flags::RECURSION_DESIRED,
            Question::new("1.0.0.127.in-addr.arpa", RecordType::Ptr),
        );

        let out = resolver.handle(query, Source::Client, client(5000), Instant::now());

        let (to, reply) = sent_reply(&out);
        assert_eq!(to, client(5000));
        assert_eq!(reply.id, 9);
        assert!(reply.flags.contains(Flags::AUTHORITATIVE_ANSWER));
        assert_eq!(reply.answers[0].data, "localhost");
        assert_eq!(reply.answers[0].ttl, 3600);
        assert_eq!(resolver.in_flight(), 0);
    }

    #[test]
    fn cache_miss_asks_the_root() {
        let mut resolver = resolver();

        let out = resolver.handle(
            a_query(7, "example.test"),
            Source::Client,
            client(5000),
            Instant::now(),
        );

        let (to, query) = sent_query(&out);
        assert_eq!(to, root());
        assert_eq!(query.kind, MessageKind::Query);
        assert!(query.flags.contains(Flags::RECURSION_DESIRED));
        assert_eq!(query.questions, vec![Question::new("example.test", RecordType::A)]);
        assert_eq!(resolver.state_of(client(5000), 7), Some(ResolutionState::AwaitingRoot));
    }

    #[test]
    fn glued_referral_reaches_final_answer() {
        let mut resolver = resolver();
        let now = Instant::now();

        let reply = resolve_via_glue(
            &mut resolver,
            client(5000),
            7,
            "example.test",
            "203.0.113.7",
            60,
            now,
        );

        assert_eq!(reply.id, 7);
        assert_eq!(reply.kind, MessageKind::Response);
        assert!(reply.flags.contains(Flags::AUTHORITATIVE_ANSWER));
        assert_eq!(reply.questions, vec![Question::new("example.test", RecordType::A)]);
        assert_eq!(reply.answers[0].data, "203.0.113.7");
        assert_eq!(resolver.in_flight(), 0);
        assert!(resolver.cache().contains("example.test", RecordType::A, now));
    }

    #[test]
    fn state_advances_to_awaiting_final_after_glue() {
        let mut resolver = resolver();
        let now = Instant::now();
        let out = resolver.handle(a_query(7, "example.test"), Source::Client, client(5000), now);
        let (to, query) = sent_query(&out);

        resolver.handle(
            referral(&query, "test", "ns.test", Some("192.0.2.53")),
            Source::Upstream,
            to,
            now,
        );

        assert_eq!(resolver.state_of(client(5000), 7), Some(ResolutionState::AwaitingFinal));
    }

    #[test]
    fn repeated_query_is_served_from_cache() {
        let mut resolver = resolver();
        let now = Instant::now();
        let first = resolve_via_glue(
            &mut resolver,
            client(5000),
            7,
            "example.test",
            "203.0.113.7",
            60,
            now,
        );

        let out = resolver.handle(a_query(7, "example.test"), Source::Client, client(5000), now);

        let (to, second) = sent_reply(&out);
        assert_eq!(to, client(5000));
        assert_eq!(second.answers, first.answers);
        assert_eq!(codec::encode(&second).unwrap(), codec::encode(&first).unwrap());
        assert_eq!(resolver.in_flight(), 0);
    }

    #[test]
    fn expired_entry_triggers_fresh_resolution() {
        let mut resolver = resolver();
        let now = Instant::now();
        resolve_via_glue(&mut resolver, client(5000), 7, "example.test", "203.0.113.7", 1, now);

        let later = now + Duration::from_secs(1);
        let out = resolver.handle(a_query(8, "example.test"), Source::Client, client(5000), later);

        let (to, _) = sent_query(&out);
        assert_eq!(to, root());
    }

    #[test]
    fn glueless_referral_resolves_authority_first() {
        let mut resolver = resolver();
        let now = Instant::now();
        let out = resolver.handle(
            a_query(7, "www.example.test"),
            Source::Client,
            client(5000),
            now,
        );
        let (to, query) = sent_query(&out);

        let out = resolver.handle(
            referral(&query, "example.test", "ns1.example.net", None),
            Source::Upstream,
            to,
            now,
        );
        let (to, ns_query) = sent_query(&out);
        assert_eq!(to, root());
        assert_eq!(ns_query.questions, vec![Question::new("ns1.example.net", RecordType::A)]);
        assert_eq!(
            resolver.state_of(client(5000), 7),
            Some(ResolutionState::AwaitingDelegationAddr)
        );
        assert_eq!(resolver.pending_delegations(), 1);

        let out = resolver.handle(answer(&ns_query, "192.0.2.99", 300), Source::Upstream, to, now);
        let (to, query) = sent_query(&out);
        assert_eq!(to, "192.0.2.99:53".parse().unwrap());
        assert_eq!(query.questions, vec![Question::new("www.example.test", RecordType::A)]);
        assert_eq!(resolver.state_of(client(5000), 7), Some(ResolutionState::AwaitingFinal));
        assert_eq!(resolver.pending_delegations(), 0);
        assert!(resolver.cache().contains("ns1.example.net", RecordType::A, now));

        let out = resolver.handle(answer(&query, "203.0.113.80", 60), Source::Upstream, to, now);
        let (to, reply) = sent_reply(&out);
        assert_eq!(to, client(5000));
        assert_eq!(reply.id, 7);
        assert_eq!(reply.answers[0].data, "203.0.113.80");
    }

    #[test]
    fn learned_authority_address_is_reused() {
        let mut resolver = resolver();
        let now = Instant::now();
        let out = resolver.handle(
            a_query(7, "www.example.test"),
            Source::Client,
            client(5000),
            now,
        );
        let (to, query) = sent_query(&out);
        let out = resolver.handle(
            referral(&query, "example.test", "ns1.example.net", None),
            Source::Upstream,
            to,
            now,
        );
        let (to, ns_query) = sent_query(&out);
        resolver.handle(answer(&ns_query, "192.0.2.99", 300), Source::Upstream, to, now);

        let out = resolver.handle(
            a_query(8, "mail.example.test"),
            Source::Client,
            client(5001),
            now,
        );
        let (to, query) = sent_query(&out);
        let out = resolver.handle(
            referral(&query, "example.test", "ns1.example.net", None),
            Source::Upstream,
            to,
            now,
        );

        let (to, _) = sent_query(&out);
        assert_eq!(to, "192.0.2.99:53".parse().unwrap());
        assert_eq!(resolver.pending_delegations(), 0);
    }

    #[test]
    fn shared_authority_lookup_is_queued_not_overwritten() {
        let mut resolver = resolver();
        let now = Instant::now();

        let out = resolver.handle(
            a_query(1, "one.example.test"),
            Source::Client,
            client(5001),
            now,
        );
        let (to, q1) = sent_query(&out);
        let out = resolver.handle(
            a_query(2, "two.example.test"),
            Source::Client,
            client(5002),
            now,
        );
        let (_, q2) = sent_query(&out);

        let out = resolver.handle(
            referral(&q1, "example.test", "ns.shared.net", None),
            Source::Upstream,
            to,
            now,
        );
        let (_, ns_query) = sent_query(&out);
        let out = resolver.handle(
            referral(&q2, "example.test", "ns.shared.net", None),
            Source::Upstream,
            to,
            now,
        );
        assert!(out.is_empty(), "second lookup must wait, not start another");
        assert_eq!(resolver.pending_delegations(), 1);

        let out = resolver.handle(answer(&ns_query, "192.0.2.10", 300), Source::Upstream, to, now);
        assert_eq!(out.len(), 2);
        let forwarded: Vec<Message> = out
            .iter()
            .map(|o| {
                assert_eq!(o.destination(), "192.0.2.10:53".parse().unwrap());
                o.message().clone()
            })
            .collect();

        let authority: SocketAddr = "192.0.2.10:53".parse().unwrap();
        for (query, port, ip) in [
            (&forwarded[1], 5002, "203.0.113.2"),
            (&forwarded[0], 5001, "203.0.113.1"),
        ] {
            let out = resolver.handle(answer(query, ip, 60), Source::Upstream, authority, now);
            let (to, reply) = sent_reply(&out);
            assert_eq!(to, client(port));
            assert_eq!(reply.answers[0].data, ip);
        }
        assert_eq!(resolver.in_flight(), 0);
    }

    #[test]
    fn interleaved_resolutions_reply_to_their_own_clients() {
        let domains = [
            ("one.test", 5001, 11, "203.0.113.1"),
            ("two.test", 5002, 22, "203.0.113.2"),
        ];

        for order in ["1122", "1212", "1221", "2112", "2121", "2211"] {
            let mut resolver = resolver();
            let now = Instant::now();
            let mut next: Vec<Outgoing> = domains
                .iter()
                .map(|(name, port, id, _)| {
                    let out = resolver.handle(
                        a_query(*id, name),
                        Source::Client,
                        client(*port),
                        now,
                    );
                    out[0].clone()
                })
                .collect();
            let mut replies = Vec::new();

            for step in order.chars() {
                let k = step.to_digit(10).unwrap() as usize - 1;
                let (_, port, _, ip) = domains[k];
                let to = next[k].destination();
                let query = next[k].message().clone();
                let response = if to == root() {
                    referral(
                        &query,
                        "test",
                        &format!("ns{k}.test"),
                        Some(&format!("192.0.2.{}", k + 1)),
                    )
                } else {
                    answer(&query, ip, 60)
                };

                let out = resolver.handle(response, Source::Upstream, to, now);
                assert_eq!(out.len(), 1, "order {order}");
                match &out[0] {
                    Outgoing::Query { .. } => next[k] = out[0].clone(),
                    Outgoing::Reply { to, message } => {
                        assert_eq!(*to, client(port), "order {order}");
                        replies.push((*to, message.clone()));
                    }
                }
            }

            assert_eq!(replies.len(), 2, "order {order}");
            for (to, message) in replies {
                let (name, _, id, ip) = domains
                    .iter()
                    .find(|d| client(d.1) == to)
                    .copied()
                    .unwrap();
                assert_eq!(message.id, id);
                assert_eq!(message.questions[0].name, name);
                assert_eq!(message.answers[0].data, ip);
            }
        }
    }

    #[test]
    fn duplicate_final_answer_is_dropped() {
        let mut resolver = resolver();
        let now = Instant::now();
        let out = resolver.handle(a_query(7, "example.test"), Source::Client, client(5000), now);
        let (to, query) = sent_query(&out);
        let final_answer = answer(&query, "203.0.113.7", 60);

        assert_eq!(resolver.handle(final_answer.clone(), Source::Upstream, to, now).len(), 1);
        assert!(resolver.handle(final_answer, Source::Upstream, to, now).is_empty());

        let out = resolver.handle(a_query(8, "example.test"), Source::Client, client(5000), now);
        let (_, reply) = sent_reply(&out);
        assert_eq!(reply.answers[0].data, "203.0.113.7");
    }

    #[test]
    fn first_cached_answer_wins() {
        let mut resolver = resolver();
        let now = Instant::now();
        let out = resolver.handle(a_query(1, "example.test"), Source::Client, client(5001), now);
        let (to, q1) = sent_query(&out);
        let out = resolver.handle(a_query(2, "example.test"), Source::Client, client(5002), now);
        let (_, q2) = sent_query(&out);

        resolver.handle(answer(&q1, "203.0.113.1", 60), Source::Upstream, to, now);
        let out = resolver.handle(answer(&q2, "203.0.113.2", 60), Source::Upstream, to, now);

        let (_, reply) = sent_reply(&out);
        assert_eq!(
            reply.answers[0].data,
            "203.0.113.2",
            "client still gets its own upstream answer"
        );
        let out = resolver.handle(a_query(3, "example.test"), Source::Client, client(5003), now);
        let (_, cached) = sent_reply(&out);
        assert_eq!(cached.answers[0].data, "203.0.113.1");
    }

    #[test]
    fn delegation_loop_ends_at_hop_limit() {
        let mut resolver = resolver();
        let now = Instant::now();
        let out = resolver.handle(a_query(7, "loop.test"), Source::Client, client(5000), now);
        let (mut to, mut query) = sent_query(&out);

        let mut referrals = 0;
        let reply = loop {
            assert!(referrals <= 50, "delegation chain never terminated");
            let out = resolver.handle(
                referral(&query, "loop.test", "ns.loop.test", Some("192.0.2.1")),
                Source::Upstream,
                to,
                now,
            );
            referrals += 1;
            match &out[0] {
                Outgoing::Query { to: next, message } => {
                    to = *next;
                    query = message.clone();
                }
                Outgoing::Reply { message, .. } => break message.clone(),
            }
        };

        assert_eq!(referrals, usize::from(ResolverConfig::default().max_hops) + 1);
        assert_eq!(reply.rcode, ResponseCode::ServFail);
        assert_eq!(resolver.in_flight(), 0);
    }

    #[test]
    fn self_referential_glueless_authority_fails() {
        let mut resolver = resolver();
        let now = Instant::now();
        let out = resolver.handle(a_query(7, "www.loop.test"), Source::Client, client(5000), now);
        let (to, query) = sent_query(&out);
        let out = resolver.handle(
            referral(&query, "loop.test", "ns.loop.test", None),
            Source::Upstream,
            to,
            now,
        );
        let (to, ns_query) = sent_query(&out);

        let out = resolver.handle(
            referral(&ns_query, "loop.test", "ns.loop.test", None),
            Source::Upstream,
            to,
            now,
        );

        let (to, reply) = sent_reply(&out);
        assert_eq!(to, client(5000));
        assert_eq!(reply.rcode, ResponseCode::ServFail);
        assert_eq!(resolver.in_flight(), 0);
        assert_eq!(resolver.pending_delegations(), 0);
    }

    #[test]
    fn timeout_replies_servfail_and_clears_state() {
        let mut resolver = resolver();
        let now = Instant::now();
        let out = resolver.handle(
            a_query(7, "www.example.test"),
            Source::Client,
            client(5000),
            now,
        );
        let (to, query) = sent_query(&out);
        resolver.handle(
            referral(&query, "example.test", "ns1.example.net", None),
            Source::Upstream,
            to,
            now,
        );

        assert!(resolver.sweep(now + Duration::from_secs(4)).is_empty());
        let out = resolver.sweep(now + Duration::from_secs(5));

        let (to, reply) = sent_reply(&out);
        assert_eq!(to, client(5000));
        assert_eq!(reply.id, 7);
        assert_eq!(reply.rcode, ResponseCode::ServFail);
        assert_eq!(resolver.in_flight(), 0);
        assert_eq!(resolver.pending_delegations(), 0);
    }

    #[test]
    fn timeout_can_abort_silently() {
        let config = ResolverConfig {
            servfail_on_failure: false,
            ..ResolverConfig::default()
        };
        let mut resolver = Resolver::new(config, Arc::new(Stats::new()));
        let now = Instant::now();
        resolver.handle(a_query(7, "example.test"), Source::Client, client(5000), now);

        assert!(resolver.sweep(now + Duration::from_secs(5)).is_empty());
        assert_eq!(resolver.in_flight(), 0);
    }

    #[test]
    fn late_response_after_timeout_is_dropped() {
        let mut resolver = resolver();
        let now = Instant::now();
        let out = resolver.handle(a_query(7, "example.test"), Source::Client, client(5000), now);
        let (to, query) = sent_query(&out);
        resolver.sweep(now + Duration::from_secs(5));

        let out = resolver.handle(answer(&query, "203.0.113.7", 60), Source::Upstream, to, now);

        assert!(out.is_empty());
        assert!(!resolver.cache().contains("example.test", RecordType::A, now));
    }

    #[test]
    fn waiters_survive_abort_of_the_lookup_owner() {
        let mut resolver = resolver();
        let t0 = Instant::now();
        let t1 = t0 + Duration::from_secs(3);

        let out = resolver.handle(a_query(1, "one.example.test"), Source::Client, client(5001), t0);
        let (to, q1) = sent_query(&out);
        resolver.handle(
            referral(&q1, "example.test", "ns.shared.net", None),
            Source::Upstream,
            to,
            t0,
        );
        let out = resolver.handle(a_query(2, "two.example.test"), Source::Client, client(5002), t1);
        let (_, q2) = sent_query(&out);
        let out = resolver.handle(
            referral(&q2, "example.test", "ns.shared.net", None),
            Source::Upstream,
            to,
            t1,
        );
        assert!(out.is_empty());

        let out = resolver.sweep(t0 + Duration::from_secs(5));

        assert_eq!(out.len(), 2);
        assert_eq!(out[0].destination(), client(5001));
        assert_eq!(out[0].message().rcode, ResponseCode::ServFail);
        let (to, ns_query) = sent_query(&out[1..]);
        assert_eq!(to, root());
        assert_eq!(ns_query.questions, vec![Question::new("ns.shared.net", RecordType::A)]);

        let now = t0 + Duration::from_secs(6);
        let out = resolver.handle(answer(&ns_query, "192.0.2.10", 300), Source::Upstream, to, now);
        let (to, query) = sent_query(&out);
        assert_eq!(query.questions[0].name, "two.example.test");
        let out = resolver.handle(answer(&query, "203.0.113.2", 60), Source::Upstream, to, now);
        let (to, reply) = sent_reply(&out);
        assert_eq!(to, client(5002));
        assert_eq!(reply.id, 2);
    }

    #[test]
    fn mismatched_or_empty_responses_leave_state_alone() {
        let mut resolver = resolver();
        let now = Instant::now();
        let out = resolver.handle(a_query(7, "example.test"), Source::Client, client(5000), now);
        let (to, query) = sent_query(&out);

        let mut spoofed = answer(&query, "203.0.113.66", 60);
        spoofed.questions = vec![Question::new("other.test", RecordType::A)];
        assert!(resolver.handle(spoofed, Source::Upstream, to, now).is_empty());

        let empty = Message::response(query.id, Flags::NONE, query.questions.clone(), Vec::new());
        assert!(resolver.handle(empty, Source::Upstream, to, now).is_empty());

        let mut unknown = answer(&query, "203.0.113.66", 60);
        unknown.id = query.id.wrapping_add(1);
        assert!(resolver.handle(unknown, Source::Upstream, to, now).is_empty());

        assert_eq!(resolver.state_of(client(5000), 7), Some(ResolutionState::AwaitingRoot));
        let out = resolver.handle(answer(&query, "203.0.113.7", 60), Source::Upstream, to, now);
        let (_, reply) = sent_reply(&out);
        assert_eq!(reply.answers[0].data, "203.0.113.7");
    }

    #[test]
    fn unsupported_query_gets_notimp() {
        let mut resolver = resolver();
        let query = Message::query(
            3,
            Flags::NONE,
            Question::new("example.test", RecordType::Other(15)),
        );

        let out = resolver.handle(query, Source::Client, client(5000), Instant::now());

        let (_, reply) = sent_reply(&out);
        assert_eq!(reply.rcode, ResponseCode::NotImp);
        assert_eq!(resolver.in_flight(), 0);
    }

    #[test]
    fn nxdomain_is_relayed_and_not_cached() {
        let mut resolver = resolver();
        let now = Instant::now();
        let out = resolver.handle(a_query(7, "missing.test"), Source::Client, client(5000), now);
        let (to, query) = sent_query(&out);
        let mut nxdomain = Message::response(
            query.id,
            Flags::AUTHORITATIVE_ANSWER,
            query.questions.clone(),
            Vec::new(),
        );
        nxdomain.rcode = ResponseCode::NxDomain;

        let out = resolver.handle(nxdomain, Source::Upstream, to, now);

        let (_, reply) = sent_reply(&out);
        assert_eq!(reply.id, 7);
        assert_eq!(reply.rcode, ResponseCode::NxDomain);
        assert!(!resolver.cache().contains("missing.test", RecordType::A, now));
        assert_eq!(resolver.in_flight(), 0);
    }

    #[test]
    fn missing_authority_fails_every_waiter() {
        let mut resolver = resolver();
        let now = Instant::now();
        let out = resolver.handle(
            a_query(1, "one.example.test"),
            Source::Client,
            client(5001),
            now,
        );
        let (to, q1) = sent_query(&out);
        let out = resolver.handle(
            a_query(2, "two.example.test"),
            Source::Client,
            client(5002),
            now,
        );
        let (_, q2) = sent_query(&out);
        let out = resolver.handle(
            referral(&q1, "example.test", "ns.gone.net", None),
            Source::Upstream,
            to,
            now,
        );
        let (_, ns_query) = sent_query(&out);
        resolver.handle(
            referral(&q2, "example.test", "ns.gone.net", None),
            Source::Upstream,
            to,
            now,
        );

        let mut nxdomain = Message::response(
            ns_query.id,
            Flags::NONE,
            ns_query.questions.clone(),
            Vec::new(),
        );
        nxdomain.rcode = ResponseCode::NxDomain;
        let out = resolver.handle(nxdomain, Source::Upstream, to, now);

        let mut clients: Vec<SocketAddr> = out.iter().map(Outgoing::destination).collect();
        clients.sort();
        assert_eq!(clients, vec![client(5001), client(5002)]);
        assert!(out.iter().all(|o| o.message().rcode == ResponseCode::ServFail));
        assert_eq!(resolver.in_flight(), 0);
        assert_eq!(resolver.pending_delegations(), 0);
    }

    #[test]
    fn capacity_limit_refuses_new_resolutions() {
        let config = ResolverConfig {
            max_resolutions: 1,
            ..ResolverConfig::default()
        };
        let mut resolver = Resolver::new(config, Arc::new(Stats::new()));
        let now = Instant::now();
        resolver.handle(a_query(1, "one.test"), Source::Client, client(5001), now);

        let out = resolver.handle(a_query(2, "two.test"), Source::Client, client(5002), now);

        let (to, reply) = sent_reply(&out);
        assert_eq!(to, client(5002));
        assert_eq!(reply.rcode, ResponseCode::ServFail);
        assert_eq!(resolver.in_flight(), 1);
    }

    #[test]
    fn retransmitted_query_is_not_resolved_twice() {
        let mut resolver = resolver();
        let now = Instant::now();
        resolver.handle(a_query(7, "example.test"), Source::Client, client(5000), now);

        let out = resolver.handle(a_query(7, "example.test"), Source::Client, client(5000), now);

        assert!(out.is_empty());
        assert_eq!(resolver.in_flight(), 1);
    }

    #[test]
    fn same_transaction_id_from_two_clients_stays_separate() {
        let mut resolver = resolver();
        let now = Instant::now();
        let out = resolver.handle(a_query(7, "one.test"), Source::Client, client(5001), now);
        let (to, q1) = sent_query(&out);
        let out = resolver.handle(a_query(7, "two.test"), Source::Client, client(5002), now);
        let (_, q2) = sent_query(&out);
        assert_ne!(q1.id, q2.id);

        let out = resolver.handle(answer(&q2, "203.0.113.2", 60), Source::Upstream, to, now);
        let (to2, reply) = sent_reply(&out);
        assert_eq!(to2, client(5002));
        assert_eq!(reply.questions[0].name, "two.test");

        let out = resolver.handle(answer(&q1, "203.0.113.1", 60), Source::Upstream, to, now);
        let (to1, reply) = sent_reply(&out);
        assert_eq!(to1, client(5001));
        assert_eq!(reply.questions[0].name, "one.test");
    }

    #[test]
    fn punycode_query_reaches_the_root_encodable() {
        let mut resolver = resolver();
        let query = a_query(7, "xn--bcher-kva.example");
        let bytes = codec::encode(&query).unwrap();

        let out = resolver.handle(
            codec::decode(&bytes).unwrap(),
            Source::Client,
            client(5000),
            Instant::now(),
        );

        let (to, root_query) = sent_query(&out);
        assert_eq!(to, root());
        assert_eq!(root_query.questions[0].name, "xn--bcher-kva.example");
        assert!(out[0].encode().is_ok());
    }

    #[test]
    fn exhausted_transaction_ids_fail_instead_of_spinning() {
        let config = ResolverConfig {
            max_resolutions: 100_000,
            ..ResolverConfig::default()
        };
        let mut resolver = Resolver::new(config, Arc::new(Stats::new()));
        for id in 0..=u16::MAX {
            resolver.in_flight.insert(id, 0);
        }

        let out = resolver.handle(
            a_query(7, "example.test"),
            Source::Client,
            client(5000),
            Instant::now(),
        );

        let (to, reply) = sent_reply(&out);
        assert_eq!(to, client(5000));
        assert_eq!(reply.rcode, ResponseCode::ServFail);
        assert_eq!(resolver.in_flight(), 0);
    }

    #[test]
    fn response_from_other_address_is_dropped() {
        let mut resolver = resolver();
        let now = Instant::now();
        let out = resolver.handle(a_query(7, "example.test"), Source::Client, client(5000), now);
        let (to, query) = sent_query(&out);
        let spoofer: SocketAddr = "203.0.113.66:53".parse().unwrap();

        let out = resolver.handle(
            answer(&query, "203.0.113.66", 60),
            Source::Upstream,
            spoofer,
            now,
        );
        assert!(out.is_empty());
        assert!(!resolver.cache().contains("example.test", RecordType::A, now));

        let out = resolver.handle(answer(&query, "203.0.113.7", 60), Source::Upstream, to, now);
        let (_, reply) = sent_reply(&out);
        assert_eq!(reply.answers[0].data, "203.0.113.7");
    }
}
