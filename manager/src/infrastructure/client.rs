use std::{net::SocketAddr, time::Duration};

use anyhow::{bail, Context, Result};
use futures::{future::BoxFuture, FutureExt, SinkExt, StreamExt};
use protocol::{
    codec::CommandClientCodec,
    master_msg::{MasterCmd, NodeReply},
    task::Task,
    TaskKey,
};
use tokio::{net::TcpStream, time};
use tracing::debug;
use utils::macros::codec::tokio_util::codec::Framed;

use crate::manager::port::NodeClient;

type Conn = Framed<TcpStream, CommandClientCodec>;

/// Talks to the command listener of a node, one connection per command.
#[derive(Debug, Clone)]
pub struct TcpNodeClient {
    offer_timeout: Duration,
    notify_timeout: Duration,
}

impl TcpNodeClient {
    pub fn new(offer_timeout: Duration, notify_timeout: Duration) -> Self {
        Self {
            offer_timeout,
            notify_timeout,
        }
    }
}

async fn request(endpoint: SocketAddr, cmd: MasterCmd) -> Result<NodeReply> {
    let tcp = TcpStream::connect(endpoint)
        .await
        .with_context(|| format!("connect to node {endpoint}"))?;
    let mut conn: Conn = Framed::new(tcp, CommandClientCodec::new());
    conn.send(cmd).await.context("send command")?;

    match conn.next().await {
        Some(reply) => reply.context("read node reply"),
        None => bail!("node {endpoint} closed the connection"),
    }
}

async fn bounded_request(timeout: Duration, endpoint: SocketAddr, cmd: MasterCmd) -> Result<NodeReply> {
    time::timeout(timeout, request(endpoint, cmd))
        .await
        .with_context(|| format!("node {endpoint} did not answer in {timeout:?}"))?
}

impl NodeClient for TcpNodeClient {
    fn offer_task(&self, endpoint: SocketAddr, task: Task) -> BoxFuture<'static, Result<bool>> {
        let timeout = self.offer_timeout;
        async move {
            let key = task.key();
            match bounded_request(timeout, endpoint, MasterCmd::Offer(task)).await? {
                NodeReply::Accepted => Ok(true),
                NodeReply::Refused(reason) => {
                    debug!(%endpoint, task = %key, %reason, "offer refused");
                    Ok(false)
                }
                NodeReply::Ack => bail!("unexpected ack to a task offer"),
            }
        }
        .boxed()
    }

    fn abort_task(&self, endpoint: SocketAddr, key: TaskKey) -> BoxFuture<'static, Result<()>> {
        let timeout = self.notify_timeout;
        async move {
            bounded_request(timeout, endpoint, MasterCmd::AbortTask(key)).await?;
            Ok(())
        }
        .boxed()
    }

    fn notify_disconnect(&self, endpoint: SocketAddr) -> BoxFuture<'static, Result<()>> {
        let timeout = self.notify_timeout;
        async move {
            bounded_request(timeout, endpoint, MasterCmd::Disconnect).await?;
            Ok(())
        }
        .boxed()
    }
}
