// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::error::Error;
use nom::number::complete::{be_u16, be_u32, u8 as parse_u8};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde_json::{Map, Value};
use std::fmt::{Display, Formatter};
use topodb::Table;

/// Protocol version carried in every header.
pub const VERSION: u8 = 1;

/// Largest frame accepted from the controller, header included.
pub const MAX_MESSAGE_SIZE: usize = 1 << 20;

/// Whether a message type pushes state, replies to a request, or asks for
/// state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Create,
    Update,
    Delete,
    Reply,
    Request,
}

/// Message type registry. The byte value is `(major << 5) + sub` where
/// major 1 is a controller message and major 2 an agent message.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive,
)]
#[repr(u8)]
pub enum MessageType {
    CreateNetwork = 33,
    UpdateNetwork = 34,
    DeleteNetwork = 35,
    CreateSubnet = 36,
    UpdateSubnet = 37,
    DeleteSubnet = 38,
    CreatePort = 39,
    UpdatePort = 40,
    DeletePort = 41,
    UpdateHostLink = 46,
    CreateVlan = 48,
    UpdateVlan = 49,
    DeleteVlan = 50,
    ReplyNetwork = 52,
    ReplySubnet = 53,
    ReplyPort = 54,
    ReplyHostLink = 56,
    ReplyError = 59,
    ReplyVlan = 60,
    RequestNetwork = 65,
    RequestSubnet = 66,
    RequestPort = 67,
    RequestHostLink = 70,
    RequestVlan = 72,
}

impl MessageType {
    /// The table a message acts on. Only `ReplyError` has none.
    pub fn table(self) -> Option<Table> {
        use MessageType::*;
        match self {
            CreateNetwork | UpdateNetwork | DeleteNetwork | ReplyNetwork
            | RequestNetwork => Some(Table::Network),
            CreateSubnet | UpdateSubnet | DeleteSubnet | ReplySubnet
            | RequestSubnet => Some(Table::Subnet),
            CreatePort | UpdatePort | DeletePort | ReplyPort | RequestPort => {
                Some(Table::Port)
            }
            CreateVlan | UpdateVlan | DeleteVlan | ReplyVlan | RequestVlan => {
                Some(Table::Vlan)
            }
            UpdateHostLink | ReplyHostLink | RequestHostLink => {
                Some(Table::HostLink)
            }
            ReplyError => None,
        }
    }

    pub fn kind(self) -> Kind {
        use MessageType::*;
        match self {
            CreateNetwork | CreateSubnet | CreatePort | CreateVlan => {
                Kind::Create
            }
            UpdateNetwork | UpdateSubnet | UpdatePort | UpdateHostLink
            | UpdateVlan => Kind::Update,
            DeleteNetwork | DeleteSubnet | DeletePort | DeleteVlan => {
                Kind::Delete
            }
            ReplyNetwork | ReplySubnet | ReplyPort | ReplyHostLink
            | ReplyError | ReplyVlan => Kind::Reply,
            RequestNetwork | RequestSubnet | RequestPort | RequestHostLink
            | RequestVlan => Kind::Request,
        }
    }

    pub fn request(table: Table) -> MessageType {
        match table {
            Table::Network => MessageType::RequestNetwork,
            Table::Subnet => MessageType::RequestSubnet,
            Table::Port => MessageType::RequestPort,
            Table::Vlan => MessageType::RequestVlan,
            Table::HostLink => MessageType::RequestHostLink,
        }
    }

    pub fn reply(table: Table) -> MessageType {
        match table {
            Table::Network => MessageType::ReplyNetwork,
            Table::Subnet => MessageType::ReplySubnet,
            Table::Port => MessageType::ReplyPort,
            Table::Vlan => MessageType::ReplyVlan,
            Table::HostLink => MessageType::ReplyHostLink,
        }
    }
}

impl Display for MessageType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let kind = match self.kind() {
            Kind::Create => "create",
            Kind::Update => "update",
            Kind::Delete => "delete",
            Kind::Reply => "reply",
            Kind::Request => "request",
        };
        match self.table() {
            Some(t) => write!(f, "{kind}-{t}"),
            None => write!(f, "{kind}-error"),
        }
    }
}

/// Validity of a message on the recovery path. A message starts green and
/// loses one step each time it is replayed from the deferred queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Color {
    #[default]
    Green,
    Yellow,
    Red,
}

impl Color {
    pub fn degrade(self) -> Color {
        match self {
            Color::Green => Color::Yellow,
            Color::Yellow | Color::Red => Color::Red,
        }
    }
}

/// Fixed frame header.
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |    Version    |     Type      |        Transaction Id         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                      Total Length                             |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub typ: MessageType,
    pub xid: u16,

    /// Total frame length including this header.
    pub length: u32,
}

impl Header {
    pub const WIRE_SIZE: usize = 8;

    pub fn new(typ: MessageType, xid: u16, length: u32) -> Result<Header, Error> {
        Self::check_length(length)?;
        Ok(Header {
            version: VERSION,
            typ,
            xid,
            length,
        })
    }

    fn check_length(length: u32) -> Result<(), Error> {
        if (length as usize) < Header::WIRE_SIZE {
            return Err(Error::TooSmall("message header length".into()));
        }
        if length as usize > MAX_MESSAGE_SIZE {
            return Err(Error::TooLarge("message header length".into()));
        }
        Ok(())
    }

    /// Length of the body that follows the header.
    pub fn body_len(&self) -> usize {
        self.length as usize - Header::WIRE_SIZE
    }

    pub fn to_wire(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Header::WIRE_SIZE);
        buf.push(self.version);
        buf.push(self.typ.into());
        buf.extend_from_slice(&self.xid.to_be_bytes());
        buf.extend_from_slice(&self.length.to_be_bytes());
        buf
    }

    pub fn from_wire(input: &[u8]) -> Result<Header, Error> {
        let (input, version) = parse_u8(input)?;
        if version != VERSION {
            return Err(Error::BadVersion(version));
        }
        let (input, typ) = parse_u8(input)?;
        let typ = MessageType::try_from(typ)?;
        let (input, xid) = be_u16(input)?;
        let (_, length) = be_u32(input)?;
        Self::check_length(length)?;
        Ok(Header {
            version,
            typ,
            xid,
            length,
        })
    }
}

/// A decoded control message. The body is always a JSON object keyed by
/// record key.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub typ: MessageType,
    pub xid: u16,
    pub body: Map<String, Value>,

    /// Local recovery state, never on the wire.
    pub color: Color,
}

impl Message {
    pub fn new(typ: MessageType, body: Map<String, Value>) -> Message {
        Message {
            typ,
            xid: 0,
            body,
            color: Color::Green,
        }
    }

    /// A request for `table`. No keys asks for the whole table as a
    /// checksum map, otherwise the listed records are requested in full.
    pub fn request(table: Table, keys: Option<Vec<String>>) -> Message {
        let mut body = Map::new();
        if let Some(keys) = keys {
            body.insert(
                "keys".into(),
                Value::Array(keys.into_iter().map(Value::String).collect()),
            );
        }
        Message::new(MessageType::request(table), body)
    }

    pub fn to_wire(&self) -> Result<Vec<u8>, Error> {
        let body = if self.body.is_empty() {
            Vec::new()
        } else {
            serde_json::to_vec(&self.body)?
        };
        let length = u32::try_from(Header::WIRE_SIZE + body.len())
            .map_err(|_| Error::TooLarge("message body".into()))?;
        let mut buf = Header::new(self.typ, self.xid, length)?.to_wire();
        buf.extend_from_slice(&body);
        Ok(buf)
    }

    pub fn from_wire(input: &[u8]) -> Result<Message, Error> {
        if input.len() < Header::WIRE_SIZE {
            return Err(Error::TooSmall("message".into()));
        }
        let header = Header::from_wire(&input[..Header::WIRE_SIZE])?;
        let input = &input[Header::WIRE_SIZE..];
        if input.len() < header.body_len() {
            return Err(Error::TooSmall("message body".into()));
        }
        Message::from_parts(header, &input[..header.body_len()])
    }

    /// Assemble a message from a decoded header and exactly the body bytes
    /// it announced.
    pub fn from_parts(header: Header, body: &[u8]) -> Result<Message, Error> {
        if body.len() != header.body_len() {
            return Err(Error::BadBody(format!(
                "expected {} body bytes, got {}",
                header.body_len(),
                body.len()
            )));
        }
        let body = if body.iter().all(u8::is_ascii_whitespace) {
            Map::new()
        } else {
            match serde_json::from_slice(body)? {
                Value::Object(m) => m,
                other => {
                    return Err(Error::BadBody(format!(
                        "body is not an object: {other}"
                    )))
                }
            }
        };
        Ok(Message {
            typ: header.typ,
            xid: header.xid,
            body,
            color: Color::Green,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use pretty_hex::PrettyHex;
    use serde_json::json;

    fn body(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn type_codes() {
        for (table, req, rep) in [
            (Table::Network, 65u8, 52u8),
            (Table::Subnet, 66, 53),
            (Table::Port, 67, 54),
            (Table::HostLink, 70, 56),
            (Table::Vlan, 72, 60),
        ] {
            assert_eq!(u8::from(MessageType::request(table)), req);
            assert_eq!(u8::from(MessageType::reply(table)), rep);
            assert_eq!(MessageType::request(table).table(), Some(table));
            assert_eq!(MessageType::reply(table).kind(), Kind::Reply);
        }
        assert_eq!(u8::from(MessageType::CreateSubnet), (1 << 5) + 4);
        assert_eq!(u8::from(MessageType::RequestVlan), (2 << 5) + 8);
        assert_eq!(MessageType::ReplyError.table(), None);
        assert_eq!(MessageType::DeleteVlan.to_string(), "delete-vlan");
        assert_eq!(
            MessageType::UpdateHostLink.to_string(),
            "update-host-link"
        );
        assert!(MessageType::try_from(0u8).is_err());
        assert!(MessageType::try_from(42u8).is_err());
    }

    #[test]
    fn header_layout() {
        let h = Header::new(MessageType::RequestPort, 0x0102, 0x0a0b0c0d)
            .unwrap_err();
        assert!(matches!(h, Error::TooLarge(_)));

        let h = Header::new(MessageType::RequestPort, 0x0102, 24).unwrap();
        let wire = h.to_wire();
        println!("{:?}", wire.hex_dump());
        assert_eq!(wire, vec![1, 67, 0x01, 0x02, 0, 0, 0, 24]);
        assert_eq!(Header::from_wire(&wire).unwrap(), h);
    }

    #[test]
    fn header_rejects_garbage() {
        assert!(matches!(
            Header::from_wire(&[2, 67, 0, 0, 0, 0, 0, 8]),
            Err(Error::BadVersion(2))
        ));
        assert!(matches!(
            Header::from_wire(&[1, 99, 0, 0, 0, 0, 0, 8]),
            Err(Error::MessageType(_))
        ));
        assert!(matches!(
            Header::from_wire(&[1, 67, 0, 0, 0, 0, 0, 7]),
            Err(Error::TooSmall(_))
        ));
        assert!(matches!(
            Header::from_wire(&[1, 67, 0, 0]),
            Err(Error::Parse(_))
        ));
    }

    #[test]
    fn full_sync_request_is_header_only() {
        let m = Message::request(Table::Subnet, None);
        let wire = m.to_wire().unwrap();
        println!("{:?}", wire.hex_dump());
        assert_eq!(wire, vec![1, 66, 0, 0, 0, 0, 0, 8]);

        let back = Message::from_wire(&wire).unwrap();
        assert_eq!(back.typ, MessageType::RequestSubnet);
        assert!(back.body.is_empty());
    }

    #[test]
    fn targeted_request_body() {
        let mut m =
            Message::request(Table::Port, Some(vec!["p1".into(), "p2".into()]));
        m.xid = 7;
        let wire = m.to_wire().unwrap();
        println!("{:?}", wire.hex_dump());

        let json = br#"{"keys":["p1","p2"]}"#;
        assert_eq!(&wire[..4], &[1, 67, 0, 7]);
        assert_eq!(
            u32::from_be_bytes([wire[4], wire[5], wire[6], wire[7]]) as usize,
            Header::WIRE_SIZE + json.len()
        );
        assert_eq!(&wire[8..], json);
    }

    #[test]
    fn push_message_decodes() {
        let b = body(json!({
            "n1": {"tenant_id": "t1", "network_name": "blue", "md5sum": "a"}
        }));
        let mut m = Message::new(MessageType::CreateNetwork, b.clone());
        m.xid = 300;
        let wire = m.to_wire().unwrap();

        let back = Message::from_wire(&wire).unwrap();
        assert_eq!(back.typ, MessageType::CreateNetwork);
        assert_eq!(back.xid, 300);
        assert_eq!(back.body, b);
        assert_eq!(back.color, Color::Green);
    }

    #[test]
    fn body_must_be_object() {
        let h = Header::new(MessageType::ReplyPort, 0, 10).unwrap();
        assert!(matches!(
            Message::from_parts(h, b"[]"),
            Err(Error::BadBody(_))
        ));
        assert!(matches!(
            Message::from_parts(h, b"{x"),
            Err(Error::Serialization(_))
        ));
        assert!(matches!(
            Message::from_parts(h, b"{}{}"),
            Err(Error::BadBody(_))
        ));
    }

    #[test]
    fn color_degrades_to_red() {
        let c = Color::default();
        assert_eq!(c, Color::Green);
        assert_eq!(c.degrade(), Color::Yellow);
        assert_eq!(c.degrade().degrade(), Color::Red);
        assert_eq!(Color::Red.degrade(), Color::Red);
    }
}
