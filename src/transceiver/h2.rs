//! HTTP/2 glue over the framing layer.

use std::sync::{Arc, Weak};

use bytes::Bytes;
use futures_util::future;
use http::Version;
use tokio::io::{AsyncRead, AsyncWrite};

use super::{
    channel::Channel,
    pool::ChannelPool,
    registry::HandleRegistry,
};
use crate::error::{Error, Result};

/// Upper bound for one DATA frame's payload from our side.
pub(crate) const DATA_SEGMENT: usize = 8 * 1024;

/// Drives the connection state machine until it exits or the channel is
/// closed, then fails whatever is still in flight.
pub(crate) async fn driver_task<IO>(
    connection: h2::client::Connection<IO, Bytes>,
    channel: Arc<Channel>,
    registry: Arc<HandleRegistry>,
    pool: Weak<ChannelPool>,
) where
    IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let shutdown = channel.closed_token();
    tokio::select! {
        result = connection => {
            if let Err(err) = result {
                log::debug!("h2 connection {} failed: {err}", channel.id());
            }
        }
        _ = shutdown.cancelled() => {}
    }
    channel.close();
    registry.clear(Error::connection_inactive);
    if let Some(pool) = pool.upgrade() {
        pool.on_channel_closed(&channel);
    }
}

/// Send `data` as DATA frames of at most [`DATA_SEGMENT`] bytes, honouring
/// the connection's flow control. `eos` closes the stream with (or after)
/// the final frame. The bytes count against the channel's outbound
/// high-water mark until the framing layer has accepted them.
pub(crate) async fn send_data(
    channel: &Channel,
    stream: &mut h2::SendStream<Bytes>,
    data: Bytes,
    eos: bool,
) -> Result<()> {
    let _reservation = channel.reserve_outbound(data.len());
    send_data_inner(stream, data, eos).await
}

async fn send_data_inner(
    stream: &mut h2::SendStream<Bytes>,
    mut data: Bytes,
    eos: bool,
) -> Result<()> {
    if data.is_empty() {
        stream.send_data(Bytes::new(), eos).map_err(Error::write)?;
        return Ok(());
    }
    while !data.is_empty() {
        let want = data.len().min(DATA_SEGMENT);
        stream.reserve_capacity(want);
        let granted = future::poll_fn(|cx| stream.poll_capacity(cx))
            .await
            .ok_or_else(|| Error::write("stream closed while sending body"))?
            .map_err(Error::write)?;
        let take = granted.min(data.len()).min(DATA_SEGMENT);
        if take == 0 {
            continue;
        }
        let chunk = data.split_to(take);
        let last = eos && data.is_empty();
        stream.send_data(chunk, last).map_err(Error::write)?;
    }
    Ok(())
}

/// End the stream without further payload.
pub(crate) fn finish(stream: &mut h2::SendStream<Bytes>) -> Result<()> {
    stream
        .send_data(Bytes::new(), true)
        .map_err(Error::write)
}

/// Waits for the response of stream `id` and routes it through the
/// registry. A missing registry entry means the exchange was timed out or
/// cancelled; the response is dropped on the floor.
pub(crate) fn spawn_response_task(
    response: h2::client::ResponseFuture,
    registry: Arc<HandleRegistry>,
    id: u32,
) {
    tokio::spawn(async move {
        match response.await {
            Ok(response) => {
                let (parts, mut body) = response.into_parts();
                let Some(mut handle) = registry.remove(id) else {
                    return;
                };
                handle.receive_head(parts.status, Version::HTTP_2, parts.headers);

                let mut flow_err = None;
                while let Some(chunk) = body.data().await {
                    match chunk {
                        Ok(chunk) => {
                            let _ = body.flow_control().release_capacity(chunk.len());
                            if let Err(err) = handle.receive_data(chunk) {
                                flow_err = Some(err);
                                break;
                            }
                        }
                        Err(err) => {
                            flow_err = Some(Error::io(err));
                            break;
                        }
                    }
                }
                match flow_err {
                    None => handle.complete(),
                    Some(err) => handle.fail(err),
                }
            }
            Err(err) => {
                if let Some(handle) = registry.remove(id) {
                    handle.fail(Error::io(err));
                }
            }
        }
    });
}
