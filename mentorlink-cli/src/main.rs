//! MentorLink CLI Application

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use mentorlink_core::prelude::*;
use mentorlink_core::relay::MemoryRelay;
use mentorlink_core::testing::{FakeDevices, FakeTransportFactory};
use mentorlink_core::{resolve_ice_servers, CallApi, CallId, HttpCallApi, RtcTransportFactory, SyntheticDevices};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Configuration file
    #[arg(short, long, env = "MENTORLINK_CONFIG", default_value = "mentorlink.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a call between in-process participants over a local relay
    Simulate {
        /// Number of participants (1 is the mentor)
        #[arg(short, long, default_value_t = 2, value_parser = clap::value_parser!(u64).range(2..=8))]
        participants: u64,

        /// Media engine to negotiate with
        #[arg(long, value_enum, default_value = "fake")]
        engine: Engine,

        /// Have the mentor share their screen mid-call
        #[arg(long)]
        share_screen: bool,

        /// Silently drop the last participant's relay connection
        #[arg(long)]
        drop_peer: bool,

        /// Seconds to hold the call before hanging up
        #[arg(long, default_value_t = 2)]
        hold_secs: u64,
    },

    /// Print the ICE servers a session would use
    IceServers {
        /// Call API base URL (overrides api_base_url)
        #[arg(long, env = "MENTORLINK_API_URL")]
        api: Option<String>,

        /// Bearer token for the call API
        #[arg(long, env = "MENTORLINK_API_TOKEN", hide_env_values = true)]
        token: Option<String>,
    },

    /// Validate the configuration file
    CheckConfig,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Engine {
    /// Scriptable in-process engine
    Fake,
    /// webrtc-rs peer connections over loopback
    Rtc,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("mentorlink=info,mentorlink_core=warn")),
        )
        .init();

    let cli = Cli::parse();
    let config = CallConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    match cli.command {
        Commands::Simulate {
            participants,
            engine,
            share_screen,
            drop_peer,
            hold_secs,
        } => {
            handle_simulate(
                config,
                participants,
                engine,
                share_screen,
                drop_peer,
                Duration::from_secs(hold_secs),
            )
            .await?;
        }
        Commands::IceServers { api, token } => {
            handle_ice_servers(&config, api, token).await?;
        }
        Commands::CheckConfig => {
            handle_check_config(&config)?;
        }
    }

    Ok(())
}

fn participant(n: u64) -> ParticipantInfo {
    if n == 1 {
        ParticipantInfo::new(n, "mentor", Role::Mentor)
    } else {
        ParticipantInfo::new(n, format!("mentee-{}", n - 1), Role::Mentee)
    }
}

fn engine_for(engine: Engine) -> Result<(Arc<dyn TransportFactory>, Arc<dyn MediaDevices>)> {
    Ok(match engine {
        Engine::Fake => (
            Arc::new(FakeTransportFactory::new()),
            Arc::new(FakeDevices::new()),
        ),
        Engine::Rtc => (Arc::new(RtcTransportFactory::new()?), Arc::new(SyntheticDevices)),
    })
}

fn describe(event: &CallEvent) -> Option<String> {
    Some(match event {
        CallEvent::StatusChanged { to, .. } => format!("status {to:?}"),
        CallEvent::ParticipantJoined { participant } => {
            format!("👋 {} ({}) joined", participant.display_name, participant.id)
        }
        CallEvent::ParticipantLeft {
            participant_id,
            synthesized,
        } => {
            if *synthesized {
                format!("⌛ {participant_id} vanished, removed after presence timeout")
            } else {
                format!("👋 {participant_id} left")
            }
        }
        CallEvent::PeerConnected { peer } => format!("✅ media path to {peer} connected"),
        CallEvent::Degraded { peer, loss_rate, .. } => {
            format!("⚠️  link to {peer} losing {:.1}% of packets", loss_rate * 100.0)
        }
        CallEvent::ConnectionFailed { peer, error } => format!("❌ link to {peer}: {error}"),
        CallEvent::ScreenShareStarted => "🖥️  screen share started".to_string(),
        CallEvent::ScreenShareStopped => "📷 camera restored".to_string(),
        CallEvent::Ended { reason, duration } => {
            format!("📞 ended ({reason:?}) after {}s", duration.num_seconds())
        }
        CallEvent::NegotiationStateChanged { .. } => return None,
    })
}

fn print_events(local: ParticipantId, mut events: broadcast::Receiver<CallEvent>) {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Some(line) = describe(&event) {
                        println!("[{local}] {line}");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(%local, skipped = n, "Event printer lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

async fn wait_for_mesh(
    mut events: broadcast::Receiver<CallEvent>,
    expected: usize,
    timeout: Duration,
) -> bool {
    let mut connected = HashSet::new();
    let finished = tokio::time::timeout(timeout, async {
        while connected.len() < expected {
            match events.recv().await {
                Ok(CallEvent::PeerConnected { peer }) => {
                    connected.insert(peer);
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    })
    .await
    .is_ok();
    finished && connected.len() >= expected
}

async fn handle_simulate(
    config: CallConfig,
    participants: u64,
    engine: Engine,
    share_screen: bool,
    drop_peer: bool,
    hold: Duration,
) -> Result<()> {
    let relay = MemoryRelay::new();
    let session_id = SessionId::for_call(CallId::new());
    println!("📡 Simulating {participants}-way call in room {session_id} ({engine:?} engine)");

    let mut sessions = Vec::new();
    let mut meshes = Vec::new();
    for n in 1..=participants {
        let info = participant(n);
        let (factory, devices) = engine_for(engine)?;
        let session = CallSession::builder(info.clone(), relay.connect(info), factory, devices)
            .with_config(config.clone())
            .with_session_id(session_id.clone())
            .build()?;
        print_events(session.local().id, session.subscribe());
        meshes.push(session.subscribe());
        let _ = session.end_on_host_exit();
        session.join().await?;
        sessions.push(session);
    }

    let expected = usize::try_from(participants - 1)?;
    let mut all_connected = true;
    for (session, events) in sessions.iter().zip(meshes) {
        if !wait_for_mesh(events, expected, Duration::from_secs(10)).await {
            println!("⚠️  {} did not reach every peer", session.local().id);
            all_connected = false;
        }
    }
    if all_connected {
        println!("✅ Full mesh established");
    }

    if share_screen {
        let mentor = &sessions[0];
        mentor.start_screen_share().await?;
        tokio::time::sleep(hold / 2).await;
        mentor.stop_screen_share().await?;
    }

    if drop_peer {
        let Some(last) = sessions.pop() else {
            bail!("no participant to drop");
        };
        let grace = config.supervisor.presence_timeout() + Duration::from_secs(1);
        println!(
            "🔌 Dropping {} without a leave; waiting {}s for presence timeout",
            last.local().id,
            grace.as_secs()
        );
        relay.drop_silently(last.local().id);
        tokio::time::sleep(grace).await;
        last.end(EndReason::LocalHangup).await;
    }

    tokio::time::sleep(hold).await;

    for session in sessions.iter().rev() {
        session.end(EndReason::LocalHangup).await;
    }
    println!(
        "📊 {} negotiation frames relayed, {} malformed frames dropped",
        relay.history().len(),
        sessions.iter().map(CallSession::dropped_messages).sum::<u64>()
    );
    Ok(())
}

async fn handle_ice_servers(
    config: &CallConfig,
    api: Option<String>,
    token: Option<String>,
) -> Result<()> {
    let client = match api.or_else(|| config.api_base_url.clone()) {
        Some(url) => Some(HttpCallApi::new(url, token)?),
        None => None,
    };
    let servers = resolve_ice_servers(
        client.as_ref().map(|c| c as &dyn CallApi),
        &config.ice_servers,
    )
    .await;
    println!("{}", serde_json::to_string_pretty(&servers)?);
    Ok(())
}

fn handle_check_config(config: &CallConfig) -> Result<()> {
    match config.validate() {
        Ok(()) => {
            println!("✅ Configuration OK");
            Ok(())
        }
        Err(issues) => {
            for issue in &issues {
                println!("  {issue}");
            }
            let errors = issues.iter().filter(|i| i.starts_with("ERROR:")).count();
            if errors > 0 {
                bail!("configuration has {errors} error(s)");
            }
            println!("⚠️  Configuration usable with warnings");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simulate_defaults() {
        let cli = Cli::try_parse_from(["mentorlink", "simulate"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("mentorlink.toml"));
        match cli.command {
            Commands::Simulate {
                participants,
                engine,
                share_screen,
                drop_peer,
                ..
            } => {
                assert_eq!(participants, 2);
                assert_eq!(engine, Engine::Fake);
                assert!(!share_screen && !drop_peer);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_participant_count_is_bounded() {
        assert!(Cli::try_parse_from(["mentorlink", "simulate", "-p", "1"]).is_err());
        assert!(Cli::try_parse_from(["mentorlink", "simulate", "-p", "9"]).is_err());
    }

    #[test]
    fn test_mentor_is_lowest_id() {
        assert_eq!(participant(1).role, Role::Mentor);
        assert_eq!(participant(3).display_name, "mentee-2");
    }

    #[tokio::test]
    async fn test_fake_simulation_runs_to_completion() {
        let mut config = CallConfig::default();
        config.monitor.enabled = false;
        handle_simulate(config, 3, Engine::Fake, true, false, Duration::from_millis(20))
            .await
            .unwrap();
    }
}
