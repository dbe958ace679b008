// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Starts a find-any search and logs every change to the known-instance set
//! until interrupted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use cm_core::{EnrichedInstanceIdentifier, QualityType, ServiceDiscoveryClient};

#[derive(Parser, Debug)]
#[command(about = "Find and track instances of a CM service")]
struct Args {
    #[arg(long, default_value = "/tmp/cm_discovery")]
    root: String,

    #[arg(long, default_value_t = 1)]
    service_id: u32,

    /// Specific instance id to search for; omit to search for any instance.
    #[arg(long)]
    instance_id: Option<u32>,

    #[arg(long, default_value = "asil_qm")]
    quality: String,
}

fn parse_quality(s: &str) -> QualityType {
    match s {
        "asil_b" => QualityType::AsilB,
        "asil_qm" => QualityType::AsilQm,
        other => {
            log::error!("unknown quality '{other}', defaulting to asil_qm");
            QualityType::AsilQm
        }
    }
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let client = ServiceDiscoveryClient::new(&args.root).expect("failed to start discovery client");
    let quality = parse_quality(&args.quality);
    let enriched = EnrichedInstanceIdentifier::new(args.service_id, args.instance_id, quality);

    let handle = client
        .start_find_service(enriched, |handles| {
            log::info!("known instances changed: {handles:?}");
        })
        .unwrap_or_else(|e| panic!("start_find_service failed: {e}"));

    let running = Arc::new(AtomicBool::new(true));
    let handler_flag = Arc::clone(&running);
    ctrlc::set_handler(move || handler_flag.store(false, Ordering::SeqCst)).expect("failed to set Ctrl-C handler");

    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));
    }

    client.stop_find_service(handle);
    log::info!("search stopped, exiting");
}
