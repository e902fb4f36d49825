//! Controller RPC glue
//!
//! The Controller owns authoritative room membership. Connect-Nodes consult
//! it exactly once per join; everything else (storage, caching, room-full
//! policy) is the Controller's business and opaque here.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::rpc::api::{JoinRoomParams, JoinRoomReply, METHOD_JOIN_ROOM};
use crate::rpc::{RpcClient, MAX_MESSAGE_SIZE};

/// Client for the Controller service
#[derive(Clone)]
pub struct ControllerClient {
    client: RpcClient,
    timeout: Duration,
}

impl ControllerClient {
    /// Connect to the Controller at `addr`
    pub async fn connect(addr: &str, timeout: Duration) -> Result<Self> {
        let client = RpcClient::connect(addr, MAX_MESSAGE_SIZE).await?;
        Ok(Self { client, timeout })
    }

    /// Record `user_id` joining `room_id` on this node
    ///
    /// A Controller-side rejection (room full, bad user) comes back as
    /// [`Error::RpcRemote`]; the session layer reports it to the client and
    /// leaves the channel unregistered.
    pub async fn join_room(&self, params: &JoinRoomParams) -> Result<JoinRoomReply> {
        let (reply, _) = self
            .client
            .call_api::<_, JoinRoomReply>(METHOD_JOIN_ROOM, params, None, self.timeout)
            .await?;
        if !reply.success {
            return Err(Error::RpcRemote(reply.message));
        }
        Ok(reply)
    }

    pub fn close(&self) {
        self.client.close();
    }
}
