//! Data types shared by the Avahi D-Bus client.
//!
//! The aliases mirror the wire types of the `org.freedesktop.Avahi` API so
//! that argument tuples line up with the remote method signatures.

use bitflags::bitflags;
use std::fmt;

/// OS dependent index of a network interface, [`IF_UNSPEC`] means "all interfaces".
pub type Interface = i32;
/// Network protocol, one of [`PROTO_INET`], [`PROTO_INET6`] or [`PROTO_UNSPEC`].
pub type Protocol = i32;
/// mDNS record name (e.g. `myhost.local`).
pub type RecordName = String;
/// DNS record class (see [`dns_class`]).
pub type RecordClass = u16;
/// DNS record type (see [`dns_type`]).
pub type RecordType = u16;
/// Raw record data.
pub type RecordData = Vec<u8>;
/// Service instance name.
pub type ServiceName = String;
/// Service type (e.g. `_http._tcp`).
pub type ServiceType = String;
/// Service subtype (e.g. `_printer._sub._http._tcp`).
pub type Subtype = String;
/// Browse/publish domain. An empty string means `.local`.
pub type Domain = String;
/// Host name of a system providing a service.
pub type Host = String;
/// Textual IPv4/IPv6 address as reported by the daemon.
pub type Address = String;
/// TCP/UDP port number.
pub type Port = u16;
/// TXT record data.
pub type Txt = Vec<Vec<u8>>;

/// Any interface.
pub const IF_UNSPEC: Interface = -1;

/// IPv4.
pub const PROTO_INET: Protocol = 0;
/// IPv6.
pub const PROTO_INET6: Protocol = 1;
/// IPv4 and IPv6.
pub const PROTO_UNSPEC: Protocol = -1;

/// DNS classes.
pub mod dns_class {
    use super::RecordClass;

    pub const IN: RecordClass = 0x01;
}

/// DNS record types.
pub mod dns_type {
    use super::RecordType;

    pub const A: RecordType = 0x01;
    pub const NS: RecordType = 0x02;
    pub const CNAME: RecordType = 0x05;
    pub const SOA: RecordType = 0x06;
    pub const PTR: RecordType = 0x0C;
    pub const HINFO: RecordType = 0x0D;
    pub const MX: RecordType = 0x0F;
    pub const TXT: RecordType = 0x10;
    pub const AAAA: RecordType = 0x1C;
    pub const SRV: RecordType = 0x21;

    /// Parse a record type mnemonic (`"ptr"`, `"AAAA"`, ...) or a numeric code.
    pub fn parse(s: &str) -> Option<RecordType> {
        let code = match s.to_ascii_uppercase().as_str() {
            "A" => A,
            "NS" => NS,
            "CNAME" => CNAME,
            "SOA" => SOA,
            "PTR" => PTR,
            "HINFO" => HINFO,
            "MX" => MX,
            "TXT" => TXT,
            "AAAA" => AAAA,
            "SRV" => SRV,
            other => return other.parse().ok(),
        };
        Some(code)
    }
}

/// State of the Avahi daemon.
///
/// Only [`ServerState::Running`] is suitable for publishing services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServerState {
    #[default]
    Invalid,
    /// Host RRs are being registered.
    Registering,
    /// All host RRs have been established.
    Running,
    /// There is a collision with a host RR. All host RRs have been withdrawn,
    /// the user should set a new host name.
    Collision,
    /// Some fatal failure happened, the server is unable to proceed.
    Failure,
}

impl ServerState {
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(Self::Invalid),
            1 => Some(Self::Registering),
            2 => Some(Self::Running),
            3 => Some(Self::Collision),
            4 => Some(Self::Failure),
            _ => None,
        }
    }

    pub fn as_raw(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Invalid => "invalid",
            Self::Registering => "registering",
            Self::Running => "running",
            Self::Collision => "collision",
            Self::Failure => "failure",
        };
        f.write_str(name)
    }
}

/// State of an entry group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EntryGroupState {
    /// The group has not yet been committed.
    #[default]
    Uncommitted,
    /// Entries are being registered.
    Registering,
    /// The entries have been established.
    Established,
    /// A name collision occurred; pick a new name and re-add the entries.
    Collision,
    Failure,
}

impl EntryGroupState {
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(Self::Uncommitted),
            1 => Some(Self::Registering),
            2 => Some(Self::Established),
            3 => Some(Self::Collision),
            4 => Some(Self::Failure),
            _ => None,
        }
    }

    pub fn as_raw(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for EntryGroupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uncommitted => "uncommitted",
            Self::Registering => "registering",
            Self::Established => "established",
            Self::Collision => "collision",
            Self::Failure => "failure",
        };
        f.write_str(name)
    }
}

bitflags! {
    /// Flags for browser and resolver creation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct LookupFlags: u32 {
        const USE_WIDE_AREA = 1;
        const USE_MULTICAST = 2;
        /// Don't request TXT data when resolving.
        const NO_TXT = 4;
        /// Don't resolve host names to addresses.
        const NO_ADDRESS = 8;
    }
}

bitflags! {
    /// Flags attached to browse and resolve results.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct LookupResultFlags: u32 {
        /// Answered from the cache.
        const CACHED = 1;
        const WIDE_AREA = 2;
        const MULTICAST = 4;
        /// The record/service resides on and was announced by the local host.
        const LOCAL = 8;
        /// The record/service was registered by this client.
        const OUR_OWN = 16;
        const STATIC = 32;
    }
}

bitflags! {
    /// Flags for publishing entries in an entry group.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PublishFlags: u32 {
        const UNIQUE = 1;
        const NO_PROBE = 2;
        const NO_ANNOUNCE = 4;
        const ALLOW_MULTIPLE = 8;
        const NO_REVERSE = 16;
        const NO_COOKIE = 32;
        /// Update existing records instead of adding new ones.
        const UPDATE = 64;
        const USE_WIDE_AREA = 128;
        const USE_MULTICAST = 256;
    }
}

/// A raw record reported by a record browser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordItem {
    pub interface: Interface,
    pub protocol: Protocol,
    pub name: RecordName,
    pub class: RecordClass,
    pub record_type: RecordType,
    pub data: RecordData,
    pub flags: LookupResultFlags,
}

/// A service instance reported by a service browser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceItem {
    pub interface: Interface,
    pub protocol: Protocol,
    pub name: ServiceName,
    pub service_type: ServiceType,
    pub domain: Domain,
    pub flags: LookupResultFlags,
}

/// Data of a resolved service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedService {
    pub interface: Interface,
    pub protocol: Protocol,
    pub name: ServiceName,
    pub service_type: ServiceType,
    pub domain: Domain,
    pub host: Host,
    /// Protocol of `address` (IPv4 or IPv6).
    pub address_protocol: Protocol,
    pub address: Address,
    pub port: Port,
    pub txt: Txt,
    pub flags: LookupResultFlags,
}

impl ResolvedService {
    /// TXT entries rendered as (lossy) UTF-8 strings.
    pub fn txt_strings(&self) -> Vec<String> {
        self.txt
            .iter()
            .map(|entry| String::from_utf8_lossy(entry).into_owned())
            .collect()
    }
}

/// Build TXT data from `key=value` strings.
pub fn txt_from_pairs<I, S>(pairs: I) -> Txt
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    pairs
        .into_iter()
        .map(|pair| pair.as_ref().as_bytes().to_vec())
        .collect()
}
