// =============================================================================
// Matrixon Matrix NextServer - Sliding Sync Binary
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Contributors: Matrixon Development Team
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Configuration check and a self-contained simulation of the sliding sync
//   engine: simulated users long-poll their room lists while a driver
//   generates room activity in the in-memory store.
//
// =============================================================================

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use matrixon_sliding_sync::{
    database::FAVOURITES, ruma::UserId, ConnectionId, ItemId, MemoryRoomStore, Notifier, PositionToken, Range,
    SlidingSyncConfig, SlidingSyncRequest, SlidingSyncService,
};
use tracing::{debug, info, instrument};
use tracing_subscriber::{prelude::*, EnvFilter};

mod clap;

const ALL_ROOMS: &str = "all_rooms";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = clap::parse();

    let config = SlidingSyncConfig::load(args.config.as_deref()).context("failed to load configuration")?;
    init_tracing(if args.verbose { "debug" } else { &config.log });
    match &args.config {
        Some(path) => info!("📁 Loaded sliding sync configuration from {}", path.display()),
        None => info!("📁 No configuration file given, using defaults and environment"),
    }
    config.validate()?;

    match args.command {
        clap::Commands::CheckConfig => {
            println!("{}", toml::to_string_pretty(&config)?);
            info!("✅ Configuration is valid");
        }
        clap::Commands::Simulate { users, rooms, rounds } => simulate(config, users, rooms, rounds).await?,
    }
    Ok(())
}

fn init_tracing(directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(directive))
        .unwrap_or_else(|e| {
            eprintln!("Invalid log filter {directive:?}: {e}");
            EnvFilter::new("warn")
        });

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[instrument(level = "debug", skip(config))]
async fn simulate(config: SlidingSyncConfig, users: usize, rooms: usize, rounds: usize) -> anyhow::Result<()> {
    anyhow::ensure!(users > 0 && rooms > 0, "simulation needs at least one user and one room");
    info!("🎬 Simulating {} users, {} rooms, {} rounds", users, rooms, rounds);

    let notifier = Notifier::new();
    let store = Arc::new(MemoryRoomStore::new(
        matrixon_sliding_sync::ruma::server_name!("matrixon.local"),
        notifier.clone(),
    ));

    let user_ids = (0..users)
        .map(|i| UserId::parse(format!("@user{i}:matrixon.local")))
        .collect::<Result<Vec<_>, _>>()?;

    let mut room_ids: Vec<ItemId> = Vec::with_capacity(rooms);
    for i in 0..rooms {
        let creator = &user_ids[i % users];
        let room_id = store.create_room(&format!("Room {i}"), creator)?;
        for member in user_ids.iter().filter(|member| *member != creator) {
            store.join(&room_id, member)?;
        }
        room_ids.push(room_id);
    }

    let service = Arc::new(SlidingSyncService::new(
        config,
        notifier.clone(),
        store.clone(),
        store.clone(),
        store.clone(),
    )?);
    let maintenance = service.spawn_maintenance();

    let clients: Vec<_> = user_ids
        .iter()
        .map(|user_id| {
            let conn = ConnectionId::new(user_id.clone(), "SIMULATOR".into(), "main");
            tokio::spawn(run_client(Arc::clone(&service), conn))
        })
        .collect();

    for round in 0..rounds {
        tokio::time::sleep(Duration::from_millis(50)).await;

        let sender = &user_ids[round % users];
        let room_id = &room_ids[(round * 7 + 3) % rooms];
        let position = store.send_message(room_id, sender, &format!("message {round}"))?;
        debug!("✉️ Round {}: {} wrote in {} at {}", round, sender, room_id, position);

        if round % 5 == 4 {
            store.set_favourite(sender, room_id, round % 10 == 4)?;
        }
        if round % 3 == 2 {
            store.rename(room_id, &format!("Room {round}"))?;
        }
    }

    tokio::time::sleep(Duration::from_millis(200)).await;
    notifier.shutdown();

    for client in clients {
        let responses = client.await??;
        debug!("👤 Client finished after {} responses", responses);
    }
    maintenance.await?;

    println!("{}", serde_json::to_string_pretty(&service.metrics())?);
    info!("🏁 Simulation finished");
    Ok(())
}

/// Long-poll until the notifier shuts down; returns the number of responses.
async fn run_client(service: Arc<SlidingSyncService>, conn: ConnectionId) -> anyhow::Result<usize> {
    let mut pos: Option<PositionToken> = None;
    let mut responses = 0;

    while !service.notifier().is_shutdown() {
        let mut request = SlidingSyncRequest::new()
            .with_list(ALL_ROOMS, vec![Range::new(0, 9)?])
            .with_list(FAVOURITES, vec![Range::new(0, 4)?])
            .with_timeout(Duration::from_secs(5));
        if let Some(pos) = &pos {
            request = request.with_pos(pos);
        }

        let result = service.sliding_sync(&conn, request).await?;
        responses += 1;
        for (list_key, list) in &result.lists {
            info!(
                "📬 {} {}: {} op(s), {} room(s) in total",
                conn.user_id,
                list_key,
                list.ops.len(),
                list.count
            );
            for op in &list.ops {
                debug!("   {}", serde_json::to_string(op)?);
            }
        }
        if !result.items.is_empty() {
            debug!("📦 {} received {} room payload(s)", conn.user_id, result.items.len());
        }
        pos = Some(result.next_pos);
    }
    Ok(responses)
}
