//! Reference namespace: the tagged-string ref kinds the kernel allocates,
//! translates, and never reuses within a process lifetime.
//!
//! Every kind is a thin, `Copy`-where-possible newtype with a `Display`/
//! `FromStr` pair so the wire/debug form (`ko12`, `o-3`, `sv1`, ...) and the
//! in-memory form never drift apart.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Import/export polarity. Signs never cross translation boundaries
/// uninterpreted: an import on one side of a c-list entry is always the
/// export on the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Sign {
    Import,
    Export,
}

impl Sign {
    fn as_char(self) -> char {
        match self {
            Sign::Import => '-',
            Sign::Export => '+',
        }
    }

    fn from_char(c: char) -> Option<Self> {
        match c {
            '-' => Some(Sign::Import),
            '+' => Some(Sign::Export),
            _ => None,
        }
    }

    /// The sign as seen from the other side of a c-list entry.
    pub fn flip(self) -> Self {
        match self {
            Sign::Import => Sign::Export,
            Sign::Export => Sign::Import,
        }
    }
}

/// A globally unique kernel object identity (`ko<N>`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KoRef(pub u64);

impl fmt::Display for KoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ko{}", self.0)
    }
}

impl FromStr for KoRef {
    type Err = RefParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_prefixed_u64(s, "ko").map(KoRef)
    }
}

/// A globally unique kernel promise identity (`kp<N>`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KpRef(pub u64);

impl fmt::Display for KpRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "kp{}", self.0)
    }
}

impl FromStr for KpRef {
    type Err = RefParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_prefixed_u64(s, "kp").map(KpRef)
    }
}

/// Either half of the kernel's two typed ref maps (`kref_to_presence` /
/// `kref_to_promise`): a kernel ref is always exactly one of these, never
/// a value that could be read as both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KRef {
    Object(KoRef),
    Promise(KpRef),
}

impl fmt::Display for KRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KRef::Object(ko) => write!(f, "{ko}"),
            KRef::Promise(kp) => write!(f, "{kp}"),
        }
    }
}

impl FromStr for KRef {
    type Err = RefParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(ko) = s.parse::<KoRef>() {
            return Ok(KRef::Object(ko));
        }
        if let Ok(kp) = s.parse::<KpRef>() {
            return Ok(KRef::Promise(kp));
        }
        Err(RefParseError(s.to_string()))
    }
}

/// What an endpoint- or remote-local ref denotes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RefKind {
    Object,
    Promise,
}

/// A vat's private view of a capability (`o±<N>` / `p±<N>`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ERef {
    pub kind: RefKind,
    pub sign: Sign,
    pub id: u64,
}

impl fmt::Display for ERef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.kind {
            RefKind::Object => 'o',
            RefKind::Promise => 'p',
        };
        write!(f, "{tag}{}{}", self.sign.as_char(), self.id)
    }
}

impl FromStr for ERef {
    type Err = RefParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, rest) = match s.strip_prefix('o') {
            Some(rest) => (RefKind::Object, rest),
            None => match s.strip_prefix('p') {
                Some(rest) => (RefKind::Promise, rest),
                None => return Err(RefParseError(s.to_string())),
            },
        };
        parse_signed_u64(rest).map(|(sign, id)| ERef { kind, sign, id })
    }
}

/// A remote kernel's view of a capability (`ro±<N>` / `rp±<N>`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RRef {
    pub kind: RefKind,
    pub sign: Sign,
    pub id: u64,
}

impl fmt::Display for RRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.kind {
            RefKind::Object => "ro",
            RefKind::Promise => "rp",
        };
        write!(f, "{tag}{}{}", self.sign.as_char(), self.id)
    }
}

impl FromStr for RRef {
    type Err = RefParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, rest) = match s.strip_prefix("ro") {
            Some(rest) => (RefKind::Object, rest),
            None => match s.strip_prefix("rp") {
                Some(rest) => (RefKind::Promise, rest),
                None => return Err(RefParseError(s.to_string())),
            },
        };
        parse_signed_u64(rest).map(|(sign, id)| RRef { kind, sign, id })
    }
}

/// An endpoint participating in capability exchange: a vat, a remote, or an
/// ephemeral system vat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EndpointId {
    Vat(u64),
    Remote(u64),
    SystemVat(u64),
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointId::Vat(n) => write!(f, "v{n}"),
            EndpointId::Remote(n) => write!(f, "r{n}"),
            EndpointId::SystemVat(n) => write!(f, "sv{n}"),
        }
    }
}

impl FromStr for EndpointId {
    type Err = RefParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(rest) = s.strip_prefix("sv") {
            return parse_plain_u64(rest, s).map(EndpointId::SystemVat);
        }
        if let Some(rest) = s.strip_prefix('v') {
            return parse_plain_u64(rest, s).map(EndpointId::Vat);
        }
        if let Some(rest) = s.strip_prefix('r') {
            return parse_plain_u64(rest, s).map(EndpointId::Remote);
        }
        Err(RefParseError(s.to_string()))
    }
}

impl EndpointId {
    /// System vat state is ephemeral across restarts (invariant 7): this is
    /// the tag the kernel store checks on startup to sweep stale entries.
    pub fn is_system(&self) -> bool {
        matches!(self, EndpointId::SystemVat(_))
    }
}

/// A named group of vats with one designated bootstrap vat (`s<N>`), or a
/// kernel-internal system subcluster (`ss<N>`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubclusterId {
    Normal(u64),
    System(u64),
}

impl fmt::Display for SubclusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubclusterId::Normal(n) => write!(f, "s{n}"),
            SubclusterId::System(n) => write!(f, "ss{n}"),
        }
    }
}

impl FromStr for SubclusterId {
    type Err = RefParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(rest) = s.strip_prefix("ss") {
            return parse_plain_u64(rest, s).map(SubclusterId::System);
        }
        if let Some(rest) = s.strip_prefix('s') {
            return parse_plain_u64(rest, s).map(SubclusterId::Normal);
        }
        Err(RefParseError(s.to_string()))
    }
}

impl From<ERef> for RRef {
    fn from(e: ERef) -> Self {
        RRef {
            kind: e.kind,
            sign: e.sign,
            id: e.id,
        }
    }
}

impl From<RRef> for ERef {
    fn from(r: RRef) -> Self {
        ERef {
            kind: r.kind,
            sign: r.sign,
            id: r.id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefParseError(pub String);

impl fmt::Display for RefParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unparseable ref: {}", self.0)
    }
}

impl std::error::Error for RefParseError {}

fn parse_prefixed_u64(s: &str, prefix: &str) -> Result<u64, RefParseError> {
    s.strip_prefix(prefix)
        .and_then(|rest| rest.parse::<u64>().ok())
        .ok_or_else(|| RefParseError(s.to_string()))
}

fn parse_plain_u64(rest: &str, whole: &str) -> Result<u64, RefParseError> {
    rest.parse::<u64>()
        .map_err(|_| RefParseError(whole.to_string()))
}

fn parse_signed_u64(rest: &str) -> Result<(Sign, u64), RefParseError> {
    let mut chars = rest.chars();
    let sign_char = chars.next().ok_or_else(|| RefParseError(rest.to_string()))?;
    let sign = Sign::from_char(sign_char).ok_or_else(|| RefParseError(rest.to_string()))?;
    let id: u64 = chars
        .as_str()
        .parse()
        .map_err(|_| RefParseError(rest.to_string()))?;
    Ok((sign, id))
}

/// Monotonic allocators for every ref/id namespace. No id is ever reused
/// within a process lifetime (§8 round-trip law), including across a
/// restart that recovers counters from the store's persisted high-water
/// marks via `resume_from`.
pub struct RefAllocator {
    next_ko: AtomicU64,
    next_kp: AtomicU64,
    next_vat: AtomicU64,
    next_remote: AtomicU64,
    next_system_vat: AtomicU64,
    next_subcluster: AtomicU64,
    next_system_subcluster: AtomicU64,
}

impl RefAllocator {
    pub fn new() -> Self {
        Self {
            next_ko: AtomicU64::new(1),
            next_kp: AtomicU64::new(1),
            next_vat: AtomicU64::new(1),
            next_remote: AtomicU64::new(1),
            next_system_vat: AtomicU64::new(1),
            next_subcluster: AtomicU64::new(1),
            next_system_subcluster: AtomicU64::new(1),
        }
    }

    /// Rebuild an allocator that resumes past every high-water mark found in
    /// persisted state, so a restart never reallocates a ref handed out in
    /// a prior incarnation.
    pub fn resume_from(marks: RefHighWaterMarks) -> Self {
        Self {
            next_ko: AtomicU64::new(marks.ko + 1),
            next_kp: AtomicU64::new(marks.kp + 1),
            next_vat: AtomicU64::new(marks.vat + 1),
            next_remote: AtomicU64::new(marks.remote + 1),
            next_system_vat: AtomicU64::new(1),
            next_subcluster: AtomicU64::new(marks.subcluster + 1),
            next_system_subcluster: AtomicU64::new(marks.system_subcluster + 1),
        }
    }

    pub fn next_ko(&self) -> KoRef {
        KoRef(self.next_ko.fetch_add(1, Ordering::SeqCst))
    }

    pub fn next_kp(&self) -> KpRef {
        KpRef(self.next_kp.fetch_add(1, Ordering::SeqCst))
    }

    pub fn next_vat(&self) -> EndpointId {
        EndpointId::Vat(self.next_vat.fetch_add(1, Ordering::SeqCst))
    }

    pub fn next_remote(&self) -> EndpointId {
        EndpointId::Remote(self.next_remote.fetch_add(1, Ordering::SeqCst))
    }

    /// System vat ids restart at 1 every incarnation: their c-list state is
    /// ephemeral (invariant 7) so there is no cross-restart uniqueness to
    /// preserve.
    pub fn next_system_vat(&self) -> EndpointId {
        EndpointId::SystemVat(self.next_system_vat.fetch_add(1, Ordering::SeqCst))
    }

    pub fn next_subcluster(&self) -> SubclusterId {
        SubclusterId::Normal(self.next_subcluster.fetch_add(1, Ordering::SeqCst))
    }

    pub fn next_system_subcluster(&self) -> SubclusterId {
        SubclusterId::System(self.next_system_subcluster.fetch_add(1, Ordering::SeqCst))
    }
}

impl Default for RefAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// High-water marks recovered from persisted store state, used to resume a
/// `RefAllocator` across a restart without ever handing out a used id again.
#[derive(Debug, Clone, Copy, Default)]
pub struct RefHighWaterMarks {
    pub ko: u64,
    pub kp: u64,
    pub vat: u64,
    pub remote: u64,
    pub subcluster: u64,
    pub system_subcluster: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ko_kp_round_trip() {
        assert_eq!("ko12".parse::<KoRef>().unwrap(), KoRef(12));
        assert_eq!(KoRef(12).to_string(), "ko12");
        assert_eq!("kp7".parse::<KpRef>().unwrap(), KpRef(7));
        assert!("kx1".parse::<KoRef>().is_err());
    }

    #[test]
    fn eref_round_trip_both_kinds_and_signs() {
        for s in ["o+5", "o-5", "p+3", "p-3"] {
            let r: ERef = s.parse().unwrap();
            assert_eq!(r.to_string(), s);
        }
    }

    #[test]
    fn rref_round_trip() {
        let r: RRef = "ro-9".parse().unwrap();
        assert_eq!(r.kind, RefKind::Object);
        assert_eq!(r.sign, Sign::Import);
        assert_eq!(r.id, 9);
        assert_eq!(r.to_string(), "ro-9");

        let r: RRef = "rp+2".parse().unwrap();
        assert_eq!(r.kind, RefKind::Promise);
        assert_eq!(r.to_string(), "rp+2");
    }

    #[test]
    fn endpoint_id_round_trip() {
        assert_eq!("v1".parse::<EndpointId>().unwrap(), EndpointId::Vat(1));
        assert_eq!("r2".parse::<EndpointId>().unwrap(), EndpointId::Remote(2));
        assert_eq!(
            "sv3".parse::<EndpointId>().unwrap(),
            EndpointId::SystemVat(3)
        );
        assert!(EndpointId::SystemVat(3).is_system());
        assert!(!EndpointId::Vat(1).is_system());
    }

    #[test]
    fn subcluster_id_round_trip() {
        assert_eq!("s1".parse::<SubclusterId>().unwrap(), SubclusterId::Normal(1));
        assert_eq!("ss2".parse::<SubclusterId>().unwrap(), SubclusterId::System(2));
        assert_eq!(SubclusterId::Normal(1).to_string(), "s1");
        assert_eq!(SubclusterId::System(2).to_string(), "ss2");
    }

    #[test]
    fn allocation_is_monotonic_and_never_reused() {
        let alloc = RefAllocator::new();
        let a = alloc.next_ko();
        let b = alloc.next_ko();
        assert_ne!(a, b);
        assert!(b.0 > a.0);

        let v1 = alloc.next_vat();
        let v2 = alloc.next_vat();
        assert_ne!(v1, v2);
    }

    #[test]
    fn resume_from_never_reallocates_a_used_id() {
        let marks = RefHighWaterMarks {
            ko: 41,
            kp: 9,
            vat: 3,
            remote: 0,
            subcluster: 1,
            system_subcluster: 0,
        };
        let alloc = RefAllocator::resume_from(marks);
        assert_eq!(alloc.next_ko(), KoRef(42));
        assert_eq!(alloc.next_vat(), EndpointId::Vat(4));
    }

    #[test]
    fn sign_flips() {
        assert_eq!(Sign::Import.flip(), Sign::Export);
        assert_eq!(Sign::Export.flip(), Sign::Import);
    }
}
