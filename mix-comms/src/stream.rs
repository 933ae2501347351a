//! Chunked receive loop: header, declared total, chunks in arrival order, end-of-stream,
//! then caller-supplied reassembly.

use mix_core::{ChunkCollector, ChunkError};
use tracing::{debug, trace};

use crate::dispatch::StreamHandle;
use crate::error::CommsError;

/// Drive `stream` to completion and hand the ordered chunks to `assemble`.
///
/// A missing or malformed `totalChunks` header fails before any chunk is read. A stream that
/// fails mid-way reports how many of the declared chunks arrived.
pub async fn receive_chunked<T, A>(stream: &mut StreamHandle, assemble: A) -> Result<T, CommsError>
where
    A: FnOnce(Vec<Vec<u8>>) -> Result<T, ChunkError>,
{
    stream.close_send().await?;
    let header = stream.header().await?;
    let mut collector = ChunkCollector::from_header(&header)?;
    debug!(peer = %stream.peer(), total = collector.total(), "receiving chunked response");

    loop {
        match stream.recv().await {
            Ok(Some(chunk)) => {
                trace!(peer = %stream.peer(), index = collector.received(), bytes = chunk.len(), "chunk");
                collector.push(chunk)?;
            }
            Ok(None) => break,
            Err(source) => {
                return Err(CommsError::StreamBroken {
                    peer: stream.peer(),
                    received: collector.received(),
                    total: collector.total(),
                    source: Box::new(source),
                })
            }
        }
    }
    stream.recv_close().await?;
    let chunks = collector.finish()?;
    Ok(assemble(chunks)?)
}
