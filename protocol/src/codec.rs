//! Length-delimited bincode frames for both directions of both links.

use utils::codec;

use crate::{
    master_msg::{MasterCmd, NodeReply},
    node_msg::{MasterReply, NodeMsg},
};

// node -> master report link
codec!(ReportServerCodec, encode: MasterReply, decode: NodeMsg);
codec!(ReportClientCodec, encode: NodeMsg, decode: MasterReply);

// master -> node command link
codec!(CommandClientCodec, encode: MasterCmd, decode: NodeReply);
codec!(CommandServerCodec, encode: NodeReply, decode: MasterCmd);
