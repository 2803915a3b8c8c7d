// Zenoh transport: frames tunnelled through a pair of key expressions
//
// Useful when the bus adapter lives on another machine that bridges frames
// onto zenoh. Each sample carries one `BusFrame::to_bytes` encoding.

use async_trait::async_trait;
use tracing::{info, warn};
use zenoh::handlers::FifoChannelHandler;
use zenoh::pubsub::{Publisher, Subscriber};
use zenoh::sample::Sample;
use zenoh::Session;

use super::driver::{BusError, BusFrame, FrameReader, FrameWriter};

fn transport_error(e: impl std::fmt::Display) -> BusError {
    BusError::Transport(e.to_string())
}

pub struct ZenohWriter {
    // Keeps the session alive as long as either half is in use
    _session: Session,
    publisher: Publisher<'static>,
}

#[async_trait]
impl FrameWriter for ZenohWriter {
    async fn write(&self, frame: &BusFrame) -> Result<(), BusError> {
        self.publisher
            .put(frame.to_bytes())
            .await
            .map_err(transport_error)
    }
}

pub struct ZenohReader {
    _session: Session,
    subscriber: Subscriber<FifoChannelHandler<Sample>>,
}

#[async_trait]
impl FrameReader for ZenohReader {
    async fn read(&mut self) -> Result<Option<BusFrame>, BusError> {
        loop {
            let sample = match self.subscriber.recv_async().await {
                Ok(sample) => sample,
                // Channel closed with the session
                Err(_) => return Ok(None),
            };
            let payload = sample.payload().to_bytes();
            match BusFrame::from_bytes(&payload) {
                Ok(frame) => return Ok(Some(frame)),
                Err(e) => warn!("Failed to parse frame sample: {}", e),
            }
        }
    }
}

/// Open a zenoh session publishing host frames on `tx_key` and reading node frames from `rx_key`
pub async fn open(tx_key: &str, rx_key: &str) -> Result<(ZenohWriter, ZenohReader), BusError> {
    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default())
        .await
        .map_err(transport_error)?;

    let publisher = session
        .declare_publisher(tx_key.to_string())
        .await
        .map_err(transport_error)?;
    let subscriber = session
        .declare_subscriber(rx_key.to_string())
        .await
        .map_err(transport_error)?;

    info!("Publishing frames to: {}", tx_key);
    info!("Subscribed to: {}", rx_key);

    Ok((
        ZenohWriter {
            _session: session.clone(),
            publisher,
        },
        ZenohReader {
            _session: session,
            subscriber,
        },
    ))
}
