//! Backpressure demonstration
//!
//! This example shows how a writable stream paces a fast producer against a
//! slow sink, and how piping inherits that pacing for free:
//! 1. A burst of writes fills the queue past the high water mark
//! 2. The stream flips to `waiting` and `ready()` stalls
//! 3. The sink drains the backlog and `ready()` resolves
//! 4. A readable stream is piped into a second slow sink with no manual
//!    flow control at all
//!
//! Run with:
//! ```bash
//! cargo run --package penstock-engine --example backpressure_demo
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use penstock_engine::{
    CountQueuingStrategy, ReadableStream, ReadableStreamController, Sink, Source, WritableStream,
};

/// Sink that takes a fixed amount of time to accept each chunk.
struct SlowSink {
    label: &'static str,
    delay: Duration,
    delivered: Arc<AtomicUsize>,
}

#[async_trait]
impl Sink<String> for SlowSink {
    async fn write(&mut self, chunk: String) -> penstock_engine::Result<()> {
        tokio::time::sleep(self.delay).await;
        self.delivered.fetch_add(1, Ordering::SeqCst);
        println!("      [{}] drained {}", self.label, chunk);
        Ok(())
    }
}

/// Source that produces a fixed run of numbered records, one per pull.
struct NumberSource {
    produced: u32,
    limit: u32,
}

#[async_trait]
impl Source<String> for NumberSource {
    async fn pull(
        &mut self,
        controller: &ReadableStreamController<String>,
    ) -> penstock_engine::Result<()> {
        if self.produced == self.limit {
            controller.close()?;
            return Ok(());
        }
        self.produced += 1;
        controller.enqueue(format!("record-{}", self.produced))?;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    println!("\n🌊 Penstock Backpressure Demo");
    println!("==============================\n");

    // Step 1: a writable stream over a slow sink, 4 chunks of headroom
    println!("📦 Step 1: Creating writable stream (high water mark: 4)");
    let delivered = Arc::new(AtomicUsize::new(0));
    let stream = WritableStream::with_strategy(
        SlowSink {
            label: "burst-sink",
            delay: Duration::from_millis(40),
            delivered: delivered.clone(),
        },
        CountQueuingStrategy::new(4),
    );
    println!("   ✅ Stream is {}\n", stream.state());

    // Step 2: burst past the mark and watch the state flip
    println!("📤 Step 2: Submitting a burst of 8 writes");
    let mut settlements = Vec::new();
    for i in 1..=8 {
        settlements.push(stream.write(format!("chunk-{}", i)));
        println!(
            "   write {} accepted -> state: {:8} queued: {}",
            i,
            stream.state().to_string(),
            stream.queued_size()
        );
    }
    println!();

    // Step 3: wait out the backpressure
    println!("⏳ Step 3: Waiting for ready() while the sink drains");
    stream.ready().await?;
    println!(
        "   ✅ ready() resolved -> state: {} queued: {}\n",
        stream.state(),
        stream.queued_size()
    );

    // Step 4: close flushes everything still queued
    println!("🏁 Step 4: Closing (flushes the remaining queue)");
    stream.close().await?;
    for settlement in settlements {
        settlement.await?;
    }
    println!(
        "   ✅ Closed; sink accepted {} of 8 chunks\n",
        delivered.load(Ordering::SeqCst)
    );

    // Step 5: the same pacing, driven by a pipe instead of by hand
    println!("🔁 Step 5: Piping 12 records through a second slow sink");
    let source = ReadableStream::new(NumberSource {
        produced: 0,
        limit: 12,
    });
    let piped = Arc::new(AtomicUsize::new(0));
    let dest = WritableStream::with_strategy(
        SlowSink {
            label: "pipe-sink",
            delay: Duration::from_millis(10),
            delivered: piped.clone(),
        },
        CountQueuingStrategy::new(2),
    );

    source.pipe_to(&dest).await?;
    println!(
        "   ✅ Pipe finished; {} records delivered, source is {}, dest is {}\n",
        piped.load(Ordering::SeqCst),
        source.state(),
        dest.state()
    );

    println!("==============================");
    println!("✅ Demo complete");
    println!();
    println!("Summary:");
    println!("  • Writes past the high water mark queued instead of blocking");
    println!("  • ready() stalled under pressure and resolved after draining");
    println!("  • close() delivered every queued chunk before settling");
    println!("  • pipe_to() paced the transfer with no manual flow control");

    Ok(())
}
