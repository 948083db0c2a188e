//! Text control sub-protocol.
//!
//! Control messages travel as [`MessageType::TEXT`](crate::types::MessageType)
//! frames: ASCII, space-separated tokens, first token selects the command.
//! They are parsed into the closed [`ControlCommand`] set up front, so handlers
//! never see raw tokens. Anything with an unknown command or the wrong number
//! of arguments fails to parse and is dropped by the caller.

use crate::node_table::NodeAddr;
use crate::types::{Handle, NodeId};
use std::fmt;

/// Placeholder used on the wire for an empty host.
const EMPTY_HOST: &str = "0";

/// Why a control payload was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ControlError {
    #[error("control payload is not valid UTF-8")]
    NotText,
    #[error("empty control payload")]
    Empty,
    #[error("unknown control command {0:?}")]
    Unknown(String),
    #[error("{command} expects {expected} argument(s), got {got}")]
    Arity {
        command: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("invalid {field}: {value:?}")]
    InvalidField { field: &'static str, value: String },
}

/// Identity and addresses of a node, as carried by `REG` and `ADDR`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeAnnounce {
    pub id: NodeId,
    pub addr: NodeAddr,
    /// Handle of the announced node's mesh control module.
    pub handle: Handle,
}

/// Every command of the control sub-protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    /// A node announces itself; the receiver should link to it.
    Reg(NodeAnnounce),
    /// Routing knowledge about a node; never opens a link by itself.
    Addr(NodeAnnounce),
    /// Center only: introduce this node to every other linked peer.
    Broadcast(NodeId),
    /// A node left the cluster.
    Unreg(NodeId),
    /// Interest in a module name.
    Sub { name: String },
    /// A module became available under `name`.
    Pub { name: String, handle: Handle },
    /// One publisher of `name`.
    Handle { name: String, handle: Handle },
    /// Every current publisher of `name`, delivered as one bracketed batch.
    Handles { name: String, handles: Vec<Handle> },
    /// Keep-alive. No reply is expected.
    Heartbeat,
}

impl ControlCommand {
    /// Parses one control payload.
    pub fn parse(payload: &[u8]) -> Result<Self, ControlError> {
        let text = std::str::from_utf8(payload).map_err(|_| ControlError::NotText)?;
        let args: Vec<&str> = text.split_whitespace().collect();
        let Some((&command, rest)) = args.split_first() else {
            return Err(ControlError::Empty);
        };

        match command {
            "REG" => Ok(ControlCommand::Reg(parse_announce("REG", rest)?)),
            "ADDR" => Ok(ControlCommand::Addr(parse_announce("ADDR", rest)?)),
            "BROADCAST" => {
                let [id] = expect_args::<1>("BROADCAST", rest)?;
                Ok(ControlCommand::Broadcast(parse_node_id(id)?))
            }
            "UNREG" => {
                let [id] = expect_args::<1>("UNREG", rest)?;
                Ok(ControlCommand::Unreg(parse_node_id(id)?))
            }
            "SUB" => {
                let [name] = expect_args::<1>("SUB", rest)?;
                Ok(ControlCommand::Sub {
                    name: name.to_string(),
                })
            }
            "PUB" => {
                let [arg] = expect_args::<1>("PUB", rest)?;
                let (name, handle) = split_named_handle(arg)?;
                Ok(ControlCommand::Pub { name, handle })
            }
            "HANDLE" => {
                let [arg] = expect_args::<1>("HANDLE", rest)?;
                let (name, handle) = split_named_handle(arg)?;
                Ok(ControlCommand::Handle { name, handle })
            }
            "HANDLES" => {
                let [arg] = expect_args::<1>("HANDLES", rest)?;
                let (name, list) = match arg.split_once(':') {
                    Some((name, list)) => (name, list),
                    None => (arg, ""),
                };
                let handles = list
                    .split(',')
                    .filter(|s| !s.is_empty())
                    .map(parse_hex_handle)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(ControlCommand::Handles {
                    name: name.to_string(),
                    handles,
                })
            }
            "HB" => {
                expect_args::<0>("HB", rest)?;
                Ok(ControlCommand::Heartbeat)
            }
            other => Err(ControlError::Unknown(other.to_string())),
        }
    }

    /// Wire form of this command.
    pub fn encode(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlCommand::Reg(node) => write_announce(f, "REG", node),
            ControlCommand::Addr(node) => write_announce(f, "ADDR", node),
            ControlCommand::Broadcast(id) => write!(f, "BROADCAST {id}"),
            ControlCommand::Unreg(id) => write!(f, "UNREG {id}"),
            ControlCommand::Sub { name } => write!(f, "SUB {name}"),
            ControlCommand::Pub { name, handle } => write!(f, "PUB {name}:{handle}"),
            ControlCommand::Handle { name, handle } => write!(f, "HANDLE {name}:{handle}"),
            ControlCommand::Handles { name, handles } => {
                write!(f, "HANDLES {name}")?;
                for (i, handle) in handles.iter().enumerate() {
                    let sep = if i == 0 { ':' } else { ',' };
                    write!(f, "{sep}{handle}")?;
                }
                Ok(())
            }
            ControlCommand::Heartbeat => f.write_str("HB"),
        }
    }
}

/// Whether `name` can travel as a module name in `SUB`, `PUB` and
/// `HANDLE(S)`: non-empty, without whitespace, `:` or `,`.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && !name.contains(|c: char| c.is_whitespace() || c == ':' || c == ',')
}

/// First frame the center writes on every accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CenterEntry {
    /// Handle of the center's directory module.
    pub center: Handle,
    /// Handle of the center's mesh control module.
    pub mesh: Handle,
}

impl CenterEntry {
    pub fn parse(payload: &[u8]) -> Result<Self, ControlError> {
        let text = std::str::from_utf8(payload).map_err(|_| ControlError::NotText)?;
        let args: Vec<&str> = text.split_whitespace().collect();
        let [center, mesh] = expect_args::<2>("center entry", &args)?;
        Ok(Self {
            center: parse_decimal_handle(center)?,
            mesh: parse_decimal_handle(mesh)?,
        })
    }

    pub fn encode(&self) -> String {
        format!("{} {}", self.center.raw(), self.mesh.raw())
    }
}

fn expect_args<'a, const N: usize>(
    command: &'static str,
    args: &[&'a str],
) -> Result<[&'a str; N], ControlError> {
    <[&str; N]>::try_from(args).map_err(|_| ControlError::Arity {
        command,
        expected: N,
        got: args.len(),
    })
}

fn parse_announce(command: &'static str, args: &[&str]) -> Result<NodeAnnounce, ControlError> {
    let [id, node_host, node_port, gate_host, gate_port, wan_host, handle] =
        expect_args::<7>(command, args)?;
    Ok(NodeAnnounce {
        id: parse_node_id(id)?,
        addr: NodeAddr {
            node_host: parse_host(node_host),
            node_port: parse_port(node_port)?,
            gate_host: parse_host(gate_host),
            gate_port: parse_port(gate_port)?,
            wan_host: parse_host(wan_host),
        },
        handle: parse_hex_handle(handle)?,
    })
}

fn write_announce(f: &mut fmt::Formatter<'_>, command: &str, node: &NodeAnnounce) -> fmt::Result {
    let addr = &node.addr;
    write!(
        f,
        "{command} {} {} {} {} {} {} {}",
        node.id,
        host_token(&addr.node_host),
        addr.node_port,
        host_token(&addr.gate_host),
        addr.gate_port,
        host_token(&addr.wan_host),
        node.handle,
    )
}

fn host_token(host: &str) -> &str {
    if host.is_empty() {
        EMPTY_HOST
    } else {
        host
    }
}

fn parse_host(token: &str) -> String {
    if token == EMPTY_HOST {
        String::new()
    } else {
        token.to_string()
    }
}

fn parse_node_id(token: &str) -> Result<NodeId, ControlError> {
    match token.parse::<u8>() {
        Ok(id) if id > 0 => Ok(NodeId(id)),
        _ => Err(ControlError::InvalidField {
            field: "node id",
            value: token.to_string(),
        }),
    }
}

fn parse_port(token: &str) -> Result<u16, ControlError> {
    token.parse().map_err(|_| ControlError::InvalidField {
        field: "port",
        value: token.to_string(),
    })
}

fn parse_hex_handle(token: &str) -> Result<Handle, ControlError> {
    u16::from_str_radix(token, 16)
        .map(Handle)
        .map_err(|_| ControlError::InvalidField {
            field: "handle",
            value: token.to_string(),
        })
}

fn parse_decimal_handle(token: &str) -> Result<Handle, ControlError> {
    token.parse().map(Handle).map_err(|_| ControlError::InvalidField {
        field: "handle",
        value: token.to_string(),
    })
}

fn split_named_handle(arg: &str) -> Result<(String, Handle), ControlError> {
    let (name, handle) = arg.split_once(':').ok_or_else(|| ControlError::InvalidField {
        field: "name:handle",
        value: arg.to_string(),
    })?;
    Ok((name.to_string(), parse_hex_handle(handle)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn announce() -> NodeAnnounce {
        NodeAnnounce {
            id: NodeId(4),
            addr: NodeAddr {
                node_host: "10.0.0.4".to_string(),
                node_port: 7100,
                gate_host: String::new(),
                gate_port: 0,
                wan_host: "203.0.113.9".to_string(),
            },
            handle: Handle(0x0401),
        }
    }

    #[test]
    fn test_reg_wire_format() {
        let text = ControlCommand::Reg(announce()).encode();
        assert_eq!(text, "REG 4 10.0.0.4 7100 0 0 203.0.113.9 0401");
        assert_eq!(
            ControlCommand::parse(text.as_bytes()),
            Ok(ControlCommand::Reg(announce()))
        );
    }

    #[test]
    fn test_handles_list() {
        let cmd = ControlCommand::parse(b"HANDLES hall:0203,0305").unwrap();
        assert_eq!(
            cmd,
            ControlCommand::Handles {
                name: "hall".to_string(),
                handles: vec![Handle(0x0203), Handle(0x0305)],
            }
        );
        assert_eq!(cmd.encode(), "HANDLES hall:0203,0305");
    }

    #[test]
    fn test_handles_without_publishers() {
        let cmd = ControlCommand::parse(b"HANDLES hall").unwrap();
        assert_eq!(
            cmd,
            ControlCommand::Handles {
                name: "hall".to_string(),
                handles: vec![],
            }
        );
        assert_eq!(cmd.encode(), "HANDLES hall");
    }

    #[test]
    fn test_pub_and_handle() {
        assert_eq!(
            ControlCommand::parse(b"PUB login:020a"),
            Ok(ControlCommand::Pub {
                name: "login".to_string(),
                handle: Handle(0x020a),
            })
        );
        assert!(matches!(
            ControlCommand::parse(b"HANDLE login"),
            Err(ControlError::InvalidField { .. })
        ));
    }

    #[test]
    fn test_wrong_arity_is_rejected() {
        assert_eq!(
            ControlCommand::parse(b"BROADCAST"),
            Err(ControlError::Arity {
                command: "BROADCAST",
                expected: 1,
                got: 0,
            })
        );
        assert!(ControlCommand::parse(b"REG 1 a 1 b 2 c").is_err());
        assert!(ControlCommand::parse(b"SUB a b").is_err());
    }

    #[test]
    fn test_unknown_and_empty() {
        assert_eq!(
            ControlCommand::parse(b"JOIN 3"),
            Err(ControlError::Unknown("JOIN".to_string()))
        );
        assert_eq!(ControlCommand::parse(b"   "), Err(ControlError::Empty));
        assert_eq!(ControlCommand::parse(&[0xff, 0xfe]), Err(ControlError::NotText));
    }

    #[test]
    fn test_reserved_node_id_is_invalid() {
        assert!(matches!(
            ControlCommand::parse(b"UNREG 0"),
            Err(ControlError::InvalidField { field: "node id", .. })
        ));
    }

    #[test]
    fn test_center_entry() {
        let entry = CenterEntry {
            center: Handle(0x0102),
            mesh: Handle(0x0101),
        };
        assert_eq!(entry.encode(), "258 257");
        assert_eq!(CenterEntry::parse(b"258 257"), Ok(entry));
        assert!(CenterEntry::parse(b"258").is_err());
    }

    #[test]
    fn test_module_names() {
        assert!(is_valid_name("hall"));
        assert!(is_valid_name("db_2"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("two words"));
        assert!(!is_valid_name("a:b"));
        assert!(!is_valid_name("a,b"));
        assert!(!is_valid_name("tab\there"));
    }
}
