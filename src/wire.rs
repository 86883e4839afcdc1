//! KRPC: the bencoded query/response/error envelope DHT nodes speak over
//! UDP (BEP 5), plus the BEP 44 `get`/`put` extensions.

use crate::bencode::BValue;
use crate::id::{ID_LEN, Id};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};

pub const COMPACT_NODE_LEN: usize = ID_LEN + 6;
pub const COMPACT_PEER_LEN: usize = 6;

/// A KRPC message with its envelope (`t`, `y`) peeled off. `None` fields on
/// decode mean "malformed peer, discard silently" per §4.2 — callers check
/// for `None` and drop the datagram rather than propagating an error for
/// every oddity the wild DHT throws at us.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub tid: Vec<u8>,
    pub body: Body,
}

#[derive(Debug, Clone)]
pub enum Body {
    Query { method: Method, args: BValue },
    Response(BValue),
    Error { code: i64, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Ping,
    FindNode,
    GetPeers,
    AnnouncePeer,
    Get,
    Put,
}

impl Method {
    fn as_bytes(self) -> &'static [u8] {
        match self {
            Method::Ping => b"ping",
            Method::FindNode => b"find_node",
            Method::GetPeers => b"get_peers",
            Method::AnnouncePeer => b"announce_peer",
            Method::Get => b"get",
            Method::Put => b"put",
        }
    }

    fn from_bytes(b: &[u8]) -> Option<Self> {
        Some(match b {
            b"ping" => Method::Ping,
            b"find_node" => Method::FindNode,
            b"get_peers" => Method::GetPeers,
            b"announce_peer" => Method::AnnouncePeer,
            b"get" => Method::Get,
            b"put" => Method::Put,
            _ => return None,
        })
    }
}

/// Parse a raw datagram into an [`Envelope`]. Returns `None` for anything
/// structurally unusable: not a dict, missing `t`/`y`, or a `y` we don't
/// recognize. This never returns an error type because a hostile or buggy
/// peer sending garbage is an expected, silent, non-event (§4.2, §7).
pub fn parse(raw: &[u8]) -> Option<Envelope> {
    let msg = crate::bencode::decode(raw).ok()?;
    let tid = msg.get_bytes(b"t")?.to_vec();
    let y = msg.get_bytes(b"y")?;
    let body = match y {
        b"q" => {
            let method = Method::from_bytes(msg.get_bytes(b"q")?)?;
            let args = msg.get(b"a")?.clone();
            Body::Query { method, args }
        }
        b"r" => Body::Response(msg.get(b"r")?.clone()),
        b"e" => {
            let e = msg.get_list(b"e")?;
            let code = e.first()?.as_int()?;
            let message = e
                .get(1)
                .and_then(BValue::as_bytes)
                .map(|b| String::from_utf8_lossy(b).into_owned())
                .unwrap_or_default();
            Body::Error { code, message }
        }
        _ => return None,
    };
    Some(Envelope { tid, body })
}

/// Extract and validate the 20-byte `id` field from a query's arguments or
/// a response dict. Any other length is a malformed peer (§4.2).
pub fn responder_id(dict: &BValue) -> Option<Id> {
    let raw = dict.get_bytes(b"id")?;
    Id::from_slice(raw)
}

fn envelope(tid: &[u8], y: &[u8], build: impl FnOnce(&mut BValue)) -> Vec<u8> {
    let mut msg = BValue::dict();
    msg.set(b"t", BValue::bytes(tid.to_vec()));
    msg.set(b"y", BValue::bytes(y.to_vec()));
    build(&mut msg);
    msg.encode()
}

fn with_id(id: &Id) -> BValue {
    let mut d = BValue::dict();
    d.set(b"id", BValue::bytes(id.0.to_vec()));
    d
}

// ---------------------------------------------------------------- queries

pub fn build_query(tid: &[u8], method: Method, args: BValue) -> Vec<u8> {
    envelope(tid, b"q", |msg| {
        msg.set(b"q", BValue::bytes(method.as_bytes().to_vec()));
        msg.set(b"a", args);
    })
}

pub fn ping_args(my_id: &Id) -> BValue {
    with_id(my_id)
}

pub fn find_node_args(my_id: &Id, target: &Id) -> BValue {
    let mut a = with_id(my_id);
    a.set(b"target", BValue::bytes(target.0.to_vec()));
    a
}

pub fn get_peers_args(my_id: &Id, info_hash: &Id) -> BValue {
    let mut a = with_id(my_id);
    a.set(b"info_hash", BValue::bytes(info_hash.0.to_vec()));
    a
}

pub fn announce_peer_args(
    my_id: &Id,
    info_hash: &Id,
    port: u16,
    token: &[u8],
    implied_port: bool,
) -> BValue {
    let mut a = with_id(my_id);
    a.set(b"info_hash", BValue::bytes(info_hash.0.to_vec()));
    a.set(b"port", BValue::Int(port as i64));
    a.set(b"token", BValue::bytes(token.to_vec()));
    if implied_port {
        a.set(b"implied_port", BValue::Int(1));
    }
    a
}

pub fn get_args(my_id: &Id, target: &Id, seq_gt: Option<i64>) -> BValue {
    let mut a = with_id(my_id);
    a.set(b"target", BValue::bytes(target.0.to_vec()));
    if let Some(seq) = seq_gt {
        a.set(b"seq", BValue::Int(seq));
    }
    a
}

/// The put argument set for both immutable and mutable items. `mutable` is
/// `None` for an immutable put (keyed purely by the hash of `v`).
pub struct MutablePutFields<'a> {
    pub k: &'a [u8; 32],
    pub salt: Option<&'a [u8]>,
    pub seq: i64,
    pub sig: &'a [u8; 64],
}

pub fn put_args(my_id: &Id, token: &[u8], v: &BValue, mutable: Option<&MutablePutFields>) -> BValue {
    let mut a = with_id(my_id);
    a.set(b"token", BValue::bytes(token.to_vec()));
    a.set(b"v", v.clone());
    if let Some(m) = mutable {
        a.set(b"k", BValue::bytes(m.k.to_vec()));
        if let Some(salt) = m.salt {
            a.set(b"salt", BValue::bytes(salt.to_vec()));
        }
        a.set(b"seq", BValue::Int(m.seq));
        a.set(b"sig", BValue::bytes(m.sig.to_vec()));
    }
    a
}

// --------------------------------------------------------------- responses

pub fn build_response(tid: &[u8], r: BValue) -> Vec<u8> {
    envelope(tid, b"r", |msg| msg.set(b"r", r))
}

pub fn ping_response(my_id: &Id) -> BValue {
    with_id(my_id)
}

pub fn find_node_response(my_id: &Id, nodes: &[(Id, SocketAddr)]) -> BValue {
    let mut r = with_id(my_id);
    r.set(b"nodes", BValue::bytes(encode_compact_nodes(nodes)));
    r
}

/// `get_peers` response: either `values` (known peers) or `nodes` (closer
/// nodes to try), always with a write `token`.
pub fn get_peers_response(
    my_id: &Id,
    token: &[u8],
    peers: Option<&[SocketAddr]>,
    nodes: Option<&[(Id, SocketAddr)]>,
) -> BValue {
    let mut r = with_id(my_id);
    r.set(b"token", BValue::bytes(token.to_vec()));
    if let Some(peers) = peers {
        let values: Vec<BValue> = peers.iter().map(|a| BValue::bytes(encode_compact_peer(*a))).collect();
        r.set(b"values", BValue::List(values));
    }
    if let Some(nodes) = nodes {
        r.set(b"nodes", BValue::bytes(encode_compact_nodes(nodes)));
    }
    r
}

pub fn announce_peer_response(my_id: &Id) -> BValue {
    with_id(my_id)
}

pub struct GetResponseFields<'a> {
    pub v: &'a BValue,
    pub mutable: Option<MutableGetFields<'a>>,
}

pub struct MutableGetFields<'a> {
    pub k: &'a [u8; 32],
    pub salt: Option<&'a [u8]>,
    pub seq: i64,
    pub sig: &'a [u8; 64],
}

pub fn get_response(
    my_id: &Id,
    token: &[u8],
    nodes: Option<&[(Id, SocketAddr)]>,
    fields: Option<&GetResponseFields>,
) -> BValue {
    let mut r = with_id(my_id);
    r.set(b"token", BValue::bytes(token.to_vec()));
    if let Some(nodes) = nodes {
        r.set(b"nodes", BValue::bytes(encode_compact_nodes(nodes)));
    }
    if let Some(fields) = fields {
        r.set(b"v", fields.v.clone());
        if let Some(m) = &fields.mutable {
            r.set(b"k", BValue::bytes(m.k.to_vec()));
            if let Some(salt) = m.salt {
                r.set(b"salt", BValue::bytes(salt.to_vec()));
            }
            r.set(b"seq", BValue::Int(m.seq));
            r.set(b"sig", BValue::bytes(m.sig.to_vec()));
        }
    }
    r
}

pub fn put_response(my_id: &Id) -> BValue {
    with_id(my_id)
}

pub fn build_error(tid: &[u8], code: i64, message: &str) -> Vec<u8> {
    envelope(tid, b"e", |msg| {
        msg.set(
            b"e",
            BValue::List(vec![BValue::Int(code), BValue::bytes(message.as_bytes().to_vec())]),
        );
    })
}

// ---------------------------------------------------------- compact forms

pub fn encode_compact_nodes(nodes: &[(Id, SocketAddr)]) -> Vec<u8> {
    let mut out = Vec::with_capacity(nodes.len() * COMPACT_NODE_LEN);
    for (id, addr) in nodes {
        let SocketAddr::V4(v4) = addr else { continue };
        out.extend_from_slice(&id.0);
        out.extend_from_slice(&v4.ip().octets());
        out.extend_from_slice(&v4.port().to_be_bytes());
    }
    out
}

pub fn parse_compact_nodes(buf: &[u8]) -> Vec<(Id, SocketAddr)> {
    let mut out = Vec::new();
    let mut i = 0;
    while i + COMPACT_NODE_LEN <= buf.len() {
        let id = Id::from_slice(&buf[i..i + ID_LEN]).expect("slice is exactly ID_LEN");
        let ip = Ipv4Addr::new(buf[i + 20], buf[i + 21], buf[i + 22], buf[i + 23]);
        let port = u16::from_be_bytes([buf[i + 24], buf[i + 25]]);
        out.push((id, SocketAddr::V4(SocketAddrV4::new(ip, port))));
        i += COMPACT_NODE_LEN;
    }
    out
}

pub fn encode_compact_peer(addr: SocketAddr) -> Vec<u8> {
    let mut out = Vec::with_capacity(COMPACT_PEER_LEN);
    match addr.ip() {
        IpAddr::V4(v4) => out.extend_from_slice(&v4.octets()),
        IpAddr::V6(_) => out.extend_from_slice(&[0u8; 4]),
    }
    out.extend_from_slice(&addr.port().to_be_bytes());
    out
}

pub fn parse_compact_peer(buf: &[u8]) -> Option<SocketAddr> {
    if buf.len() != COMPACT_PEER_LEN {
        return None;
    }
    let ip = Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]);
    let port = u16::from_be_bytes([buf[4], buf[5]]);
    Some(SocketAddr::V4(SocketAddrV4::new(ip, port)))
}

/// The canonical BEP-44 signature input: `3:seq i<seq> e 1:v <bencode(v)>`,
/// with a `4:salt<len>:<bytes>` segment spliced in before `seq` when a salt
/// is present. This exact byte layout — not a generic bencoded dict — is
/// what gets signed and verified.
pub fn mutable_signature_input(seq: i64, salt: Option<&[u8]>, v: &BValue) -> Vec<u8> {
    let mut out = Vec::new();
    if let Some(salt) = salt {
        if !salt.is_empty() {
            out.extend_from_slice(b"4:salt");
            out.extend_from_slice(salt.len().to_string().as_bytes());
            out.push(b':');
            out.extend_from_slice(salt);
        }
    }
    out.extend_from_slice(b"3:seqi");
    out.extend_from_slice(seq.to_string().as_bytes());
    out.extend_from_slice(b"e1:v");
    out.extend_from_slice(&v.encode());
    out
}
