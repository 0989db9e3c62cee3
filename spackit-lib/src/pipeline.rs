//! End-to-end decoding: framing, layout resolution, field decoding and aggregation.
use std::io::Read;
use std::sync::Arc;
use std::thread;

use crossbeam::channel::{bounded, Receiver, Sender};
use tracing::{debug, span, Level};

use crate::aggregate::{Aggregator, Decoded};
use crate::decode::{decode_packet, DecodedRecord};
use crate::layout::PacketLayout;
use crate::registry::DefinitionRegistry;
use crate::spacepacket::{CancelToken, FramingError, PacketFramer, PrimaryHeader};
use crate::{Error, Result};

/// Configuration for [`decode_stream`].
#[derive(Debug, Clone)]
pub struct DecodeOpts {
    include_primary_header: bool,
    num_threads: usize,
    buffer_size: usize,
    cancel: Option<CancelToken>,
}

impl Default for DecodeOpts {
    fn default() -> Self {
        Self {
            include_primary_header: false,
            num_threads: 1,
            buffer_size: Self::DEFAULT_BUFFER_SIZE,
            cancel: None,
        }
    }
}

impl DecodeOpts {
    const DEFAULT_BUFFER_SIZE: usize = 1024;

    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Prefix every record with the primary header columns. See
    /// [`HEADER_COLUMNS`](crate::decode::HEADER_COLUMNS).
    #[must_use]
    pub fn with_primary_header(mut self, enabled: bool) -> Self {
        self.include_primary_header = enabled;
        self
    }

    /// Number of field decoding threads. 1 (default) decodes on the calling thread, 0 chooses
    /// the number of threads automatically.
    #[must_use]
    pub fn with_num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = num_threads;
        self
    }

    /// Set the allowable number of framed packets waiting to be aggregated when decoding with
    /// more than one thread.
    #[must_use]
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Stop framing, between packets, once `token` is cancelled.
    #[must_use]
    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    #[must_use]
    pub fn include_primary_header(&self) -> bool {
        self.include_primary_header
    }

    #[must_use]
    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    fn framer<R: Read>(&self, reader: R) -> PacketFramer<R> {
        let framer = PacketFramer::new(reader);
        match self.cancel {
            Some(ref token) => framer.with_cancel(token.clone()),
            None => framer,
        }
    }
}

/// Decode all packets in `reader` on the calling thread.
///
/// Framing errors end the run; everything decoded before the error is returned along with the
/// error in [`Decoded::framing_error`].
pub fn decode_sequential<R: Read>(
    reader: R,
    registry: &DefinitionRegistry,
    opts: &DecodeOpts,
) -> Decoded {
    let mut framer = opts.framer(reader);
    let mut aggregator = Aggregator::new(opts.include_primary_header);

    for zult in &mut framer {
        match zult {
            Ok(packet) => aggregator.push(&packet, registry.resolve(packet.apid())),
            Err(err) => aggregator.fail(err),
        }
    }
    if framer.was_cancelled() {
        aggregator.cancel();
    }
    aggregator.finish()
}

enum Job {
    Decoded(PrimaryHeader, Arc<PacketLayout>, DecodedRecord),
    Unknown(PrimaryHeader),
    Failed(FramingError),
}

fn dispatch<R: Read>(
    mut framer: PacketFramer<R>,
    registry: &DefinitionRegistry,
    pool: &rayon::ThreadPool,
    include_header: bool,
    jobs: &Sender<Receiver<Job>>,
) -> bool {
    for zult in &mut framer {
        let (future_tx, future_rx) = bounded(1);
        // capacity 1, sends cannot block; a gone consumer is reported by the jobs send
        match zult {
            Ok(packet) => match registry.resolve_shared(packet.apid()) {
                Some(layout) => {
                    // spawn_fifo so older packets are decoded first
                    pool.spawn_fifo(move || {
                        let record = decode_packet(&layout, &packet, include_header);
                        if future_tx
                            .send(Job::Decoded(packet.header, layout, record))
                            .is_err()
                        {
                            debug!(offset = packet.offset, "failed to send decoded record");
                        }
                    });
                }
                None => {
                    let _ = future_tx.send(Job::Unknown(packet.header));
                }
            },
            Err(err) => {
                let _ = future_tx.send(Job::Failed(err));
            }
        }
        if let Err(err) = jobs.send(future_rx) {
            debug!("failed to send decode job: {err}");
            break;
        }
    }
    framer.was_cancelled()
}

/// Decode all packets in `reader`, decoding packet fields in parallel when configured with more
/// than one thread.
///
/// Framing always happens on a single dispatch thread since each packet's position depends on
/// the previous packet's length. Framed packets are decoded on a pool of threads and the results
/// are aggregated in stream order, so the tables are identical to those produced by
/// [`decode_sequential`].
///
/// # Example
/// ```
/// use std::io::Cursor;
/// use spackit::layout::{FieldSpec, PacketLayout, ValueType};
/// use spackit::pipeline::{decode_stream, DecodeOpts};
/// use spackit::registry::RegistryBuilder;
///
/// let mut builder = RegistryBuilder::new();
/// builder
///     .register(PacketLayout::new(1369, vec![FieldSpec::new("X", 0, 8, ValueType::Unsigned)]))
///     .unwrap();
/// let registry = builder.build();
///
/// let dat = vec![0xd, 0x59, 0xc0, 0x01, 0x0, 0x0, 0x2a];
/// let decoded = decode_stream(Cursor::new(dat), &registry, &DecodeOpts::new().with_num_threads(2))
///     .unwrap();
/// assert_eq!(decoded.record_count(), 1);
/// ```
///
/// # Errors
/// If the decode thread pool or dispatch thread cannot be created.
pub fn decode_stream<R>(reader: R, registry: &DefinitionRegistry, opts: &DecodeOpts) -> Result<Decoded>
where
    R: Read + Send + 'static,
{
    if opts.num_threads == 1 {
        return Ok(decode_sequential(reader, registry, opts));
    }

    let pool = {
        let mut builder =
            rayon::ThreadPoolBuilder::new().thread_name(|i| format!("spackit::decode{i}"));
        if opts.num_threads > 0 {
            builder = builder.num_threads(opts.num_threads);
        }
        Arc::new(builder.build()?)
    };

    let (jobs_tx, jobs_rx) = bounded(opts.buffer_size.max(1));
    let framer = opts.framer(reader);
    let include_header = opts.include_primary_header;
    let handle = {
        let registry = registry.clone();
        let pool = pool.clone();
        thread::Builder::new()
            .name("spackit::dispatch".into())
            .spawn(move || {
                let cancelled = dispatch(framer, &registry, &pool, include_header, &jobs_tx);
                debug!("spackit::dispatch thread exit");
                cancelled
            })?
    };

    let span = span!(Level::TRACE, "aggregate");
    let _guard = span.enter();
    let mut aggregator = Aggregator::new(include_header);
    for future in jobs_rx {
        match future.recv() {
            Ok(Job::Decoded(header, layout, record)) => {
                aggregator.accept(&header, Some((layout.as_ref(), record)));
            }
            Ok(Job::Unknown(header)) => aggregator.accept(&header, None),
            Ok(Job::Failed(err)) => aggregator.fail(err),
            Err(err) => debug!("decode job finished without a result: {err}"),
        }
    }

    match handle.join() {
        Ok(true) => aggregator.cancel(),
        Ok(false) => {}
        Err(_) => return Err(Error::Worker("dispatch thread panicked".into())),
    }
    // keep the pool alive until all jobs have reported
    drop(pool);
    Ok(aggregator.finish())
}
