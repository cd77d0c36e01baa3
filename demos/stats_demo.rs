use std::collections::hash_map::RandomState;
use std::sync::Barrier;
use std::thread;

use clap::Parser;
use concurrent_hopscotch::ConcurrentMap;
use concurrent_hopscotch::Error;
use concurrent_hopscotch::Options;

#[derive(Parser, Debug)]
struct Args {
    #[arg(short = 'c', long = "target_capacity", default_value_t = 1000)]
    target_capacity: usize,
    #[arg(short = 'k', long = "keys", default_value_t = 100_000)]
    keys: u64,
    #[arg(short = 't', long = "threads", default_value_t = 4)]
    threads: u64,
    #[arg(short = 's', long = "max_segments", default_value_t = 65536)]
    max_segments: usize,
}

fn main() {
    let args = Args::parse();

    println!(
        "Creating ConcurrentMap with target capacity: {}",
        args.target_capacity
    );

    let options = Options {
        capacity: args.target_capacity,
        concurrency_level: args.threads.max(1) as usize,
        max_segments: args.max_segments,
    };
    let map: ConcurrentMap<u64, u64, RandomState> =
        match ConcurrentMap::with_options_and_hasher(options, RandomState::new()) {
            Ok(map) => map,
            Err(error) => {
                eprintln!("{error}");
                std::process::exit(2);
            }
        };

    println!("Initial capacity: {}", map.capacity());
    println!(
        "Inserting {} keys from {} threads...",
        args.keys, args.threads
    );

    let threads = args.threads.max(1);
    let barrier = Barrier::new(threads as usize);
    let failures = thread::scope(|s| {
        let workers = (0..threads)
            .map(|t| {
                let map = &map;
                let barrier = &barrier;
                s.spawn(move || {
                    barrier.wait();
                    let mut exhausted = 0u64;
                    let mut key = t;
                    while key < args.keys {
                        match map.try_insert(key, key) {
                            Ok(_) => {}
                            Err(Error::ResourceExhausted { .. }) => exhausted += 1,
                            Err(error) => panic!("unexpected error: {error}"),
                        }
                        key += threads;
                    }
                    exhausted
                })
            })
            .collect::<Vec<_>>();

        workers
            .into_iter()
            .map(|worker| worker.join().unwrap_or(0))
            .sum::<u64>()
    });

    println!("Inserted {} keys into map", map.len());
    println!(
        "Final capacity: {} ({} segments)",
        map.capacity(),
        map.segment_count()
    );
    println!(
        "Final load factor: {:.2}%",
        (map.len() as f64 / map.capacity() as f64) * 100.0
    );

    map.print_probe_histogram();
    map.debug_stats().print();
    println!(
        "Number of inserts rejected at the segment ceiling: {} ({:.02}%)",
        failures,
        failures as f64 / args.keys.max(1) as f64 * 100.0
    );

    match map.validate() {
        Ok(()) => println!("Neighborhood invariants hold"),
        Err(error) => println!("Validation failed: {error}"),
    }
}
