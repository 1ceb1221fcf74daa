use std::net::{IpAddr, SocketAddr};

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use protocol::{
    codec::ReportServerCodec,
    handshake::HandShakeResp,
    node_msg::{MasterReply, NodeMsg},
};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};
use utils::macros::codec::tokio_util::codec::Framed;

use crate::manager::{Event, Master};

/// Accepts node connections until the task is aborted.
pub async fn serve(master: Master, listener: TcpListener) {
    info!(addr = ?listener.local_addr().ok(), "listening for nodes");
    loop {
        let (tcp, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(err) => {
                warn!(?err, "cannot accept node connection");
                continue;
            }
        };
        let master = master.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_conn(master, tcp, peer).await {
                warn!(?err, %peer, "node connection closed");
            }
        });
    }
}

async fn handle_conn(master: Master, tcp: TcpStream, peer: SocketAddr) -> Result<()> {
    debug!(%peer, "node connected to the report listener");
    let mut conn = Framed::new(tcp, ReportServerCodec::new());
    while let Some(msg) = conn.next().await {
        let msg = msg.context("decode node message")?;
        let reply = handle_msg(&master, msg, peer.ip());
        conn.send(reply).await.context("reply to node")?;
    }
    Ok(())
}

pub fn handle_msg(master: &Master, msg: NodeMsg, peer: IpAddr) -> MasterReply {
    match msg {
        NodeMsg::Connect(req) => {
            let name = req.name.clone();
            match master.connect(req, peer) {
                Ok(id) => MasterReply::Connected(HandShakeResp::accepted(id)),
                Err(err) => {
                    warn!(?err, %name, %peer, "node rejected");
                    MasterReply::Connected(HandShakeResp::rejected(format!("{err:#}")))
                }
            }
        }
        NodeMsg::Status(report) => {
            master.send(Event::StatusReceived(report));
            MasterReply::Ack
        }
        NodeMsg::TaskReports(reports) => {
            master.send(Event::TaskReportsReceived(reports));
            MasterReply::Ack
        }
        NodeMsg::Crash(report) => {
            master.send(Event::CrashReceived(report));
            MasterReply::Ack
        }
        NodeMsg::Disconnect(id) => {
            master.send(Event::NodeDisconnected(id));
            MasterReply::Ack
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use protocol::{
        codec::ReportClientCodec,
        node_msg::{CrashCause, CrashReport},
        NodeState,
    };

    use super::*;
    use crate::{
        config::ManagerConfig,
        manager::test::{fake_ports, hello, wait_for, MemoryStore},
    };

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn node_session() {
        let master = Master::start(
            &ManagerConfig::default(),
            fake_ports(Arc::default(), Arc::new(MemoryStore::default())),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(serve(master.clone(), listener));

        let tcp = TcpStream::connect(addr).await.unwrap();
        let mut conn = Framed::new(tcp, ReportClientCodec::new());

        conn.send(NodeMsg::Connect(hello("remote", 2))).await.unwrap();
        let Some(Ok(MasterReply::Connected(resp))) = conn.next().await else {
            panic!("expected a handshake answer");
        };
        assert!(resp.accepted);
        let id = resp.unid.unwrap();

        // the same id cannot be claimed while connected
        let mut again = hello("remote", 2);
        again.unid = Some(id.to_string());
        conn.send(NodeMsg::Connect(again)).await.unwrap();
        let Some(Ok(MasterReply::Connected(resp))) = conn.next().await else {
            panic!("expected a handshake answer");
        };
        assert!(!resp.accepted && resp.msg.is_some());

        let crash = CrashReport {
            unid: id.clone(),
            cause: CrashCause {
                fatal: true,
                message: "disk full".to_string(),
            },
        };
        conn.send(NodeMsg::Crash(crash)).await.unwrap();
        assert!(matches!(conn.next().await, Some(Ok(MasterReply::Ack))));
        wait_for("crash", || master.nodes()[0].status == NodeState::Crashed).await;

        conn.send(NodeMsg::Disconnect(id)).await.unwrap();
        assert!(matches!(conn.next().await, Some(Ok(MasterReply::Ack))));
        wait_for("disconnect", || master.nodes()[0].status == NodeState::NotConnected).await;

        server.abort();
    }
}
