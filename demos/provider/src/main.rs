// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Offers one service instance and keeps it offered until interrupted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use cm_core::{QualityType, ServiceDiscoveryClient};

#[derive(Parser, Debug)]
#[command(about = "Offer a CM service instance for discovery")]
struct Args {
    /// Discovery root directory.
    #[arg(long, default_value = "/tmp/cm_discovery")]
    root: String,

    #[arg(long, default_value_t = 1)]
    service_id: u32,

    #[arg(long, default_value_t = 1)]
    instance_id: u32,

    /// Offer quality: "asil_b" or "asil_qm".
    #[arg(long, default_value = "asil_b")]
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

    client
        .offer_service(args.service_id, args.instance_id, quality)
        .unwrap_or_else(|e| panic!("offer_service failed: {e}"));
    log::info!("offering service_id={} instance_id={} quality={quality}", args.service_id, args.instance_id);

    let running = Arc::new(AtomicBool::new(true));
    let handler_flag = Arc::clone(&running);
    ctrlc::set_handler(move || handler_flag.store(false, Ordering::SeqCst)).expect("failed to set Ctrl-C handler");

    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));
    }

    log::info!("shutting down, releasing offer");
}
