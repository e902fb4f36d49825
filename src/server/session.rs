//! Per-connection session
//!
//! Every session runs as two tasks. The reader owns the socket's receive
//! half and the session's pinned read buffer: it decodes frames, gates the
//! first one through auth, stages the rest on the inbound ring and wakes
//! the dispatcher. The dispatcher owns the send half: it waits on the
//! signal mailbox, runs the request state machine for ring frames and
//! writes server pushes straight out.
//!
//! Auth gate: the first accepted frame must carry a room id and user id
//! with op join (1) or auth (7). An op-7 auth installs the channel into its
//! bucket and room immediately; an op-1 join defers installation until the
//! Controller accepts, so a rejected join leaves the session unroutable.
//! Frames failing the gate are dropped and the session eventually dies by
//! idle timeout.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes, BytesMut};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};

use crate::bucket::{Channel, ChannelParts, Signal};
use crate::error::{Error, Result};
use crate::protocol::frame::op;
use crate::protocol::{Frame, FrameCodec};
use crate::ring::{RingConsumer, RingProducer};
use crate::rpc::api::JoinRoomParams;
use crate::server::NodeServer;
use crate::stats::{incr, Metrics};
use tokio::sync::mpsc;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Accept, authenticate and run one client session to completion
pub(crate) async fn serve(server: Arc<NodeServer>, stream: TcpStream, peer: SocketAddr, session_id: u64) {
    let metrics = Arc::clone(server.metrics());
    incr(&metrics.sessions_opened);

    let cfg = server.config().clone();
    let expected_path = cfg.websocket.path.clone();
    let check_path = move |req: &Request, response: Response| {
        if req.uri().path() == expected_path {
            Ok(response)
        } else {
            let mut resp = ErrorResponse::new(Some("not found".to_string()));
            *resp.status_mut() = StatusCode::NOT_FOUND;
            Err(resp)
        }
    };

    let ws = match tokio::time::timeout(cfg.protocol.handshake_timeout(), accept_hdr_async(stream, check_path)).await
    {
        Ok(Ok(ws)) => ws,
        Ok(Err(err)) => {
            tracing::debug!(session_id, peer = %peer, %err, "websocket handshake failed");
            incr(&metrics.sessions_closed);
            return;
        }
        Err(_) => {
            tracing::debug!(session_id, peer = %peer, "websocket handshake timed out");
            incr(&metrics.sessions_closed);
            return;
        }
    };

    let (mut sink, mut source) = ws.split();
    let pool = server.reader_pool(session_id);
    let mut codec = FrameCodec::new(pool.get());
    let mut pending = BytesMut::new();
    let session_timeout = cfg.websocket.session_timeout();

    // Auth gate: read until the first acceptable frame or give up.
    let first = match read_auth_frame(&mut source, &mut codec, &mut pending, session_timeout, &metrics).await {
        Some(frame) => frame,
        None => {
            tracing::debug!(session_id, peer = %peer, "session ended before auth");
            let _ = sink.close().await;
            pool.put(codec.into_buffer());
            incr(&metrics.sessions_closed);
            return;
        }
    };

    let (ch, parts) = Channel::new(
        first.user_id.clone(),
        peer.ip().to_string(),
        0,
        cfg.protocol.cli_proto,
        cfg.protocol.svr_proto,
    );
    if first.op == op::AUTH {
        server.bucket(&ch.key).put(&first.room_id, &ch);
    }
    tracing::info!(session_id, key = %ch.key, room = %first.room_id, auth_op = first.op, "session authenticated");

    let ChannelParts {
        mut ring_tx,
        ring_rx,
        signal_rx,
    } = parts;

    let dispatcher = tokio::spawn(dispatch(
        Arc::clone(&server),
        Arc::clone(&ch),
        ring_rx,
        signal_rx,
        sink,
        cfg.websocket.write_timeout(),
    ));

    // The auth frame itself goes through the normal request pipeline (a
    // join must still consult the Controller and get its reply).
    enqueue(&mut ring_tx, &ch, first, &metrics).await;

    read_loop(
        &ch,
        &mut source,
        &mut codec,
        &mut pending,
        &mut ring_tx,
        session_timeout,
        cfg.websocket.heartbeat_period(),
        &metrics,
    )
    .await;

    ch.close();
    server.bucket(&ch.key).del(&ch);
    let _ = dispatcher.await;
    pool.put(codec.into_buffer());
    incr(&metrics.sessions_closed);
    tracing::info!(session_id, key = %ch.key, "session closed");
}

async fn read_auth_frame(
    source: &mut WsSource,
    codec: &mut FrameCodec,
    pending: &mut BytesMut,
    session_timeout: Duration,
    metrics: &Metrics,
) -> Option<Frame> {
    loop {
        let msg = match tokio::time::timeout(session_timeout, source.next()).await {
            Err(_) => {
                tracing::debug!("idle timeout before auth");
                return None;
            }
            Ok(None) => return None,
            Ok(Some(Err(err))) => {
                tracing::debug!(%err, "read failed before auth");
                return None;
            }
            Ok(Some(Ok(msg))) => msg,
        };
        let data = match msg {
            Message::Binary(data) => data,
            Message::Close(_) => return None,
            _ => continue,
        };

        pending.extend_from_slice(&data);
        loop {
            match codec.read(pending) {
                Ok((frame, consumed)) => {
                    pending.advance(consumed);
                    incr(&metrics.frames_in);
                    let acceptable = !frame.room_id.is_empty()
                        && !frame.user_id.is_empty()
                        && (frame.op == op::AUTH || frame.op == op::JOIN_ROOM);
                    if acceptable {
                        return Some(frame);
                    }
                    tracing::warn!(op = frame.op, room = %frame.room_id, user = %frame.user_id, "auth failed, frame dropped");
                }
                Err(Error::NotEnoughStream) => break,
                Err(err) => {
                    tracing::warn!(%err, "malformed frame before auth");
                    return None;
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn read_loop(
    ch: &Arc<Channel>,
    source: &mut WsSource,
    codec: &mut FrameCodec,
    pending: &mut BytesMut,
    ring_tx: &mut RingProducer,
    session_timeout: Duration,
    heartbeat_period: Duration,
    metrics: &Metrics,
) {
    let close = ch.close_token();
    let mut last_active = Instant::now();
    let mut cron = tokio::time::interval(heartbeat_period);
    cron.tick().await;

    loop {
        tokio::select! {
            // Set when this session is replaced by a newer login or the
            // dispatcher gave up on the socket.
            _ = close.cancelled() => return,
            _ = cron.tick() => {
                if last_active.elapsed() > session_timeout {
                    tracing::info!(key = %ch.key, "session idle timeout");
                    return;
                }
            }
            msg = source.next() => {
                let msg = match msg {
                    None => return,
                    Some(Err(err)) => {
                        tracing::debug!(key = %ch.key, %err, "session read failed");
                        return;
                    }
                    Some(Ok(msg)) => msg,
                };
                match msg {
                    Message::Binary(data) => {
                        last_active = Instant::now();
                        pending.extend_from_slice(&data);
                        loop {
                            match codec.read(pending) {
                                Ok((frame, consumed)) => {
                                    pending.advance(consumed);
                                    incr(&metrics.frames_in);
                                    enqueue(ring_tx, ch, frame, metrics).await;
                                }
                                Err(Error::NotEnoughStream) => break,
                                Err(err) => {
                                    tracing::warn!(key = %ch.key, %err, "malformed frame, closing session");
                                    return;
                                }
                            }
                        }
                    }
                    Message::Close(_) => return,
                    Message::Ping(_) | Message::Pong(_) | Message::Text(_) => {
                        last_active = Instant::now();
                    }
                    Message::Frame(_) => {}
                }
            }
        }
    }
}

/// Stage one frame on the ring and wake the dispatcher
///
/// Ring-full is a drop, not backpressure: the reader never stalls behind a
/// slow dispatcher.
async fn enqueue(ring_tx: &mut RingProducer, ch: &Arc<Channel>, frame: Frame, metrics: &Metrics) {
    match ring_tx.set() {
        Ok(slot) => {
            *slot = frame;
            ring_tx.set_adv();
            ch.signal_ready().await;
        }
        Err(err) => {
            incr(&metrics.ring_dropped);
            tracing::warn!(key = %ch.key, %err, "inbound ring full, frame dropped");
        }
    }
}

async fn dispatch(
    server: Arc<NodeServer>,
    ch: Arc<Channel>,
    mut ring_rx: RingConsumer,
    mut signal_rx: mpsc::Receiver<Signal>,
    mut sink: WsSink,
    write_timeout: Duration,
) {
    let close = ch.close_token();
    'run: loop {
        tokio::select! {
            _ = close.cancelled() => break 'run,
            sig = signal_rx.recv() => {
                let Some(sig) = sig else { break 'run };
                match sig {
                    Signal::Ready => {
                        loop {
                            // Clone keeps the body alive past slot release;
                            // bodies are refcounted so this copies nothing.
                            let frame = match ring_rx.get() {
                                Ok(frame) => frame.clone(),
                                Err(_) => break,
                            };
                            ring_rx.get_adv();
                            if let Err(err) = process_client_request(&server, &ch, &mut sink, &frame, write_timeout).await {
                                tracing::warn!(key = %ch.key, op = frame.op, seq = frame.seq, %err, "client request failed");
                            }
                        }
                    }
                    Signal::Push(frame) => {
                        if let Err(err) = write_frame(&mut sink, &frame, write_timeout, server.metrics()).await {
                            tracing::debug!(key = %ch.key, %err, "push write failed");
                            break 'run;
                        }
                    }
                }
            }
        }
    }
    // Make sure the reader stops too when the write side gave up first.
    ch.close();
    let _ = sink.close().await;
}

/// The op state machine for client-originated frames
async fn process_client_request(
    server: &Arc<NodeServer>,
    ch: &Arc<Channel>,
    sink: &mut WsSink,
    frame: &Frame,
    write_timeout: Duration,
) -> Result<()> {
    match frame.op {
        op::JOIN_ROOM => {
            let params = JoinRoomParams {
                user_id: frame.user_id.clone(),
                user_name: frame.user_id.clone(),
                room_id: frame.room_id.clone(),
                node_id: server.node_id().to_string(),
            };
            // A Controller rejection propagates without installing the
            // channel; the client may retry the join.
            server.controller().join_room(&params).await?;

            let bucket = server.bucket(&ch.key);
            match ch.room() {
                None => bucket.put(&frame.room_id, ch),
                Some(room) if room.id != frame.room_id => bucket.change_room(&frame.room_id, ch),
                Some(_) => {}
            }
            ch.watch(&[op::PUSH_MSG]);

            let reply = frame.reply_to(op::PUSH_MSG, Bytes::from_static(b"join room success"));
            write_frame(sink, &reply, write_timeout, server.metrics()).await
        }
        op::HEARTBEAT => write_frame(sink, &frame.heartbeat_reply(), write_timeout, server.metrics()).await,
        op::AUTH => {
            tracing::debug!(key = %ch.key, "auth frame on established session");
            Ok(())
        }
        other => {
            tracing::warn!(key = %ch.key, op = other, "unknown op, frame dropped");
            Ok(())
        }
    }
}

async fn write_frame(sink: &mut WsSink, frame: &Frame, write_timeout: Duration, metrics: &Metrics) -> Result<()> {
    let data = FrameCodec::write(frame)?;
    match tokio::time::timeout(write_timeout, sink.send(Message::Binary(data.to_vec()))).await {
        Err(_) => Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "session write timed out",
        ))),
        Ok(Err(err)) => Err(err.into()),
        Ok(Ok(())) => {
            incr(&metrics.frames_out);
            Ok(())
        }
    }
}
