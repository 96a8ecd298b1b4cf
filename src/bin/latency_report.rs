use hdrhistogram::Histogram;
use ladder_book::{
    BookConfig, BookProcessor, Instruction, InstructionKind, MemoryStore, Result, Side,
};
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use rust_decimal::Decimal;
use std::time::{Duration, Instant};

const ITERATIONS: u64 = 200_000;
/// Ladder depth the generator hovers around
const TARGET_DEPTH: u32 = 50;

fn next_instruction(rng: &mut ChaCha8Rng, depth: [u32; 2]) -> Instruction {
    let side = if rng.gen_bool(0.5) { Side::Bid } else { Side::Ask };
    let len = depth[side as usize];
    let price = Decimal::new(rng.gen_range(10_000..10_500), 2);
    let quantity = rng.gen_range(1..=100);

    // Grow below the target depth, churn above it
    let roll = rng.gen_range(0..10);
    if len == 0 || (len < TARGET_DEPTH && roll < 6) {
        return Instruction::new_level(side, rng.gen_range(1..=len + 1), price, quantity);
    }
    let index = rng.gen_range(1..=len);
    match roll {
        0..=5 => Instruction::update(side, index, price, quantity),
        6..=7 => Instruction::new_level(side, index, price, quantity),
        _ => Instruction::delete(side, index),
    }
}

fn main() -> Result<()> {
    println!("Preparing Latency Benchmark...");

    let config = BookConfig::default();
    let mut book = BookProcessor::start(MemoryStore::new(), &config)?;
    let mut rng = ChaCha8Rng::seed_from_u64(42);
    let mut depth = [0u32; 2];

    let mut histograms: Vec<Histogram<u64>> = (0..3)
        .map(|_| Histogram::<u64>::new_with_bounds(1, 10_000_000, 3))
        .collect::<std::result::Result<Vec<_>, hdrhistogram::CreationError>>()
        .map_err(std::io::Error::other)?;
    let mut total_duration = Duration::ZERO;

    println!("Running {} iterations...", ITERATIONS);

    for _ in 0..ITERATIONS {
        let instruction = next_instruction(&mut rng, depth);

        let start = Instant::now();
        let outcome = std::hint::black_box(book.submit(instruction));
        let elapsed = start.elapsed();

        outcome?;
        let slot = &mut depth[instruction.side as usize];
        match instruction.kind {
            InstructionKind::New => *slot += 1,
            InstructionKind::Delete => *slot -= 1,
            InstructionKind::Update => {}
        }

        histograms[instruction.kind as usize]
            .record(elapsed.as_nanos() as u64)
            .unwrap_or(());
        total_duration += elapsed;
    }

    println!("\n=== Latency Report (ns) ===");
    println!("Total Ops:  {}", ITERATIONS);
    println!("Throughput: {:.2} ops/sec", ITERATIONS as f64 / total_duration.as_secs_f64());
    println!("Final depth: bid {} / ask {}", depth[0], depth[1]);

    let kinds = [InstructionKind::New, InstructionKind::Update, InstructionKind::Delete];
    for (kind, histogram) in kinds.iter().zip(&histograms) {
        if histogram.is_empty() {
            continue;
        }
        println!("--------- {:?} ({} ops) ---------", kind, histogram.len());
        println!("Min:    {:8} ns", histogram.min());
        println!("P50:    {:8} ns", histogram.value_at_quantile(0.50));
        println!("P90:    {:8} ns", histogram.value_at_quantile(0.90));
        println!("P99:    {:8} ns", histogram.value_at_quantile(0.99));
        println!("P99.9:  {:8} ns", histogram.value_at_quantile(0.999));
        println!("Max:    {:8} ns", histogram.max());
    }

    let start = Instant::now();
    let snapshot = book.order_book(TARGET_DEPTH)?;
    println!("\nSnapshot of {} rows built in {:?}", snapshot.len(), start.elapsed());
    Ok(())
}
