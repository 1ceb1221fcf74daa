use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::{task::CodecSet, NodeId};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HandShakeReq {
    /// Empty or absent for a node connecting for the first time.
    pub unid: Option<String>,
    pub name: String,
    /// Falls back to the peer address of the connection when absent.
    pub address: Option<IpAddr>,
    pub listen_port: u16,
    pub threads: u32,
    pub codecs: CodecSet,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HandShakeResp {
    pub accepted: bool,
    pub unid: Option<NodeId>,
    pub msg: Option<String>,
}

impl HandShakeResp {
    pub fn accepted(unid: NodeId) -> Self {
        Self {
            accepted: true,
            unid: Some(unid),
            msg: None,
        }
    }

    pub fn rejected(msg: impl Into<String>) -> Self {
        Self {
            accepted: false,
            unid: None,
            msg: Some(msg.into()),
        }
    }
}
