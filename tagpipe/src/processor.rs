use anyhow::Result;
use std::thread::JoinHandle;
use tagwire::Tag;
#[allow(unused_imports)]
use tracing::{debug, error, info, span, warn, Level};

use crate::pipeline::Pipeline;

/// Runs a pipeline on its own thread, fed raw packets from `receiver`.
///
/// Each non-empty batch of events leaving the pipeline goes to `sender`.
/// Packets that fail to parse or decode are logged and skipped. When the
/// input side disconnects, the pipeline is flushed and handed back through
/// the join handle so its counters can be read.
pub fn spawn(
    receiver: flume::Receiver<Vec<u8>>,
    sender: flume::Sender<Vec<Tag>>,
    mut pipeline: Pipeline,
) -> Result<JoinHandle<Pipeline>> {
    let handle = std::thread::Builder::new()
        .name("tagpipe".into())
        .spawn(move || {
            let span = span!(Level::INFO, "processor");
            let _enter = span.enter();
            let send = |batch: Vec<Tag>| {
                if !batch.is_empty() && sender.send(batch).is_err() {
                    debug!("downstream receiver gone");
                }
            };
            for buf in receiver.iter() {
                match pipeline.process_bytes(&buf) {
                    Ok(batch) => send(batch),
                    Err(e) => warn!(%e, "packet skipped"),
                }
            }
            send(pipeline.finish());
            info!("input closed");
            pipeline
        })?;
    Ok(handle)
}
