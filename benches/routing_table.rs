//! Micro-benchmarks for RoutingTable operations: sightings, closest contacts,
//! and removals at varying table sizes. Reports nanoseconds-per-operation.
//!
//! Run: `cargo bench --bench routing_table`

use std::net::SocketAddr;
use std::time::Instant;

use kademlia_dht::{Contact, Id, RoutingTable, DEFAULT_ID_BITS, MAX_BUCKET_SIZE_K};

fn main() {
    println!("routing_table\n");

    bench_record_sighting();
    bench_closest_contacts();
    bench_remove();
}

fn address() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 6881))
}

fn contacts(count: usize) -> Vec<Contact> {
    (0..count)
        .map(|_| Contact::random(DEFAULT_ID_BITS, address()))
        .collect()
}

fn table_with(count: usize) -> RoutingTable {
    let table = RoutingTable::new(Id::random(DEFAULT_ID_BITS), MAX_BUCKET_SIZE_K);

    for contact in contacts(count) {
        table.record_sighting(contact);
    }

    table
}

fn bench_record_sighting() {
    println!("record_sighting");

    // Pre-generate random contacts outside the timed section
    let fresh = contacts(1000);

    for size in [0, 100, 400] {
        let table = table_with(size);

        let start = Instant::now();
        for contact in fresh.iter().cloned() {
            table.record_sighting(contact);
        }
        let per_op = start.elapsed().as_nanos() / fresh.len() as u128;

        println!(
            "{size:>3} contacts: {per_op}ns/op (final size: {})",
            table.size()
        );
    }

    // Refreshing known contacts
    {
        let table = table_with(0);
        let known = contacts(100);

        for contact in known.iter().cloned() {
            table.record_sighting(contact);
        }

        let start = Instant::now();
        for _ in 0..10 {
            for contact in known.iter().cloned() {
                table.record_sighting(contact);
            }
        }
        let per_op = start.elapsed().as_nanos() / (known.len() * 10) as u128;

        println!("refresh:      {per_op}ns/op");
    }

    println!();
}

fn bench_closest_contacts() {
    println!("closest_contacts");

    let targets: Vec<_> = (0..1000).map(|_| Id::random(DEFAULT_ID_BITS)).collect();

    for size in [50, 100, 200, 400] {
        let table = table_with(size);

        let start = Instant::now();
        for target in &targets {
            let _ = table.closest_contacts(target, MAX_BUCKET_SIZE_K);
        }
        let per_op = start.elapsed().as_nanos() / targets.len() as u128;

        println!("{size:>3} contacts: {per_op}ns/op");
    }

    println!();
}

fn bench_remove() {
    println!("remove");

    let table = table_with(0);
    let known = contacts(200);

    for contact in known.iter().cloned() {
        table.record_sighting(contact);
    }

    let n = known.len();
    let start = Instant::now();
    for contact in &known {
        table.remove(contact.id());
    }
    let per_op = start.elapsed().as_nanos() / n as u128;

    println!("{per_op}ns/op ({n} removals)");
    println!();
}
