use std::io::Write;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde::Serialize;

use crate::capture::DeviceSelector;
use crate::meter::Meter;

/// Process arguments.
#[derive(Parser, Debug)]
#[command(version, about = "Star Resonance combat meter")]
pub struct Args {
    /// Config file (defaults to $RESONANCE_METER_CONFIG or ./config.json)
    #[arg(short, long)]
    pub config: Option<PathBuf>,
    /// Capture device name, or "auto" to probe for game traffic
    #[arg(short, long)]
    pub device: Option<String>,
    /// Print capture devices and exit
    #[arg(long)]
    pub list_devices: bool,
}

#[derive(Parser)]
#[command(version, about = "meter")]
struct Repl {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    Devices,
    /// Restart capture on another device
    Switch {
        device: String,
    },
    Status,
    Stats,
    Solo,
    Skills {
        uid: u64,
        /// Show damage and healing tables separately
        #[arg(short, long)]
        breakdown: bool,
    },
    Enemies,
    Pause,
    Resume,
    Session,
    Reset,
    Clear,
    Name {
        uid: u64,
        name: String,
    },
    /// Mark the local player; omit the uid to unset
    Me {
        uid: Option<u64>,
    },
    Save,
    Quit,
}

#[derive(Debug, PartialEq)]
pub enum Reply {
    Text(String),
    Quit,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Status<'a> {
    device: Option<String>,
    running: bool,
    encounter: crate::services::encounter::EncounterSnapshot,
    counters: crate::services::sniffer::CountersSnapshot,
    history_dir: &'a std::path::Path,
}

pub fn readline() -> Result<String, String> {
    write!(std::io::stdout(), "> ").map_err(|e| e.to_string())?;
    std::io::stdout().flush().map_err(|e| e.to_string())?;
    let mut buffer = String::new();
    let read = std::io::stdin().read_line(&mut buffer).map_err(|e| e.to_string())?;
    if read == 0 {
        // EOF behaves like quit
        return Ok("quit".to_string());
    }
    Ok(buffer)
}

pub fn run_repl(meter: &Meter) -> Result<(), String> {
    loop {
        let line = readline()?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match respond(line, meter) {
            Ok(Reply::Quit) => break,
            Ok(Reply::Text(text)) => {
                writeln!(std::io::stdout(), "{text}").map_err(|e| e.to_string())?;
            }
            Err(err) => {
                writeln!(std::io::stdout(), "{err}").map_err(|e| e.to_string())?;
            }
        }
        std::io::stdout().flush().map_err(|e| e.to_string())?;
    }
    Ok(())
}

pub fn respond(line: &str, meter: &Meter) -> Result<Reply, String> {
    let mut args = shlex::split(line).ok_or("error: Invalid quoting")?;
    args.insert(0, "meter".to_string());
    let cli = Repl::try_parse_from(args).map_err(|e| e.to_string())?;

    let text = match cli.command {
        None => return Ok(Reply::Text(String::new())),
        Some(Commands::Quit) => return Ok(Reply::Quit),
        Some(Commands::Devices) => to_json(&meter.list_devices().map_err(|e| e.to_string())?)?,
        Some(Commands::Switch { device }) => {
            let selector: DeviceSelector = device.parse().map_err(|_| "error: invalid device")?;
            let opened = meter.switch_device(&selector).map_err(|e| e.to_string())?;
            format!("capturing on {opened}")
        }
        Some(Commands::Status) => to_json(&Status {
            device: meter.current_device(),
            running: meter.is_running(),
            encounter: meter.encounter(),
            counters: meter.counters(),
            history_dir: &meter.config().history_dir,
        })?,
        Some(Commands::Stats) => to_json(&meter.store().get_all_users_data())?,
        Some(Commands::Solo) => to_json(&meter.store().get_solo_user_data())?,
        Some(Commands::Skills { uid, breakdown: false }) => match meter.store().get_user_skill_data(uid) {
            Some(skills) => to_json(&skills)?,
            None => return Err(format!("error: no player {uid}")),
        },
        Some(Commands::Skills { uid, breakdown: true }) => match meter.store().get_user_skill_breakdown(uid) {
            Some(tables) => to_json(&tables)?,
            None => return Err(format!("error: no player {uid}")),
        },
        Some(Commands::Enemies) => to_json(&meter.store().get_all_enemies_data())?,
        Some(Commands::Pause) => (if meter.pause() { "paused" } else { "already paused" }).to_string(),
        Some(Commands::Resume) => (if meter.resume() { "resumed" } else { "not paused" }).to_string(),
        Some(Commands::Session) => to_json(&meter.session_snapshot())?,
        Some(Commands::Reset) => {
            meter.reset_statistics();
            "statistics reset".to_string()
        }
        Some(Commands::Clear) => {
            meter.clear_all();
            "all data cleared".to_string()
        }
        Some(Commands::Name { uid, name }) => {
            meter.store().set_name(uid, &name);
            format!("{uid} is now {name}")
        }
        Some(Commands::Me { uid }) => {
            meter.store().set_local_player_uid(uid);
            match uid {
                Some(uid) => format!("local player is {uid}"),
                None => "local player unset".to_string(),
            }
        }
        Some(Commands::Save) => {
            let path = meter.save_history().map_err(|e| e.to_string())?;
            format!("saved {}", path.display())
        }
    };
    Ok(Reply::Text(text))
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::io::now_ms;
    use crate::protocol::types::{DamageDealt, EntityKind, Event, TimedEvent};

    fn meter() -> Meter {
        let dir = std::env::temp_dir().join(format!("resonance-meter-cli-{}-{}", std::process::id(), now_ms()));
        let meter = Meter::new(AppConfig { history_dir: dir, ..AppConfig::default() });
        meter.store().apply(&TimedEvent::new(
            1_000,
            Event::DamageDealt(DamageDealt {
                source_uid: 100,
                target_uid: 5,
                skill_id: 7,
                amount: 250,
                hp_lessen: 0,
                element: 0,
                critical: true,
                lucky: false,
                source_kind: EntityKind::Player,
                target_kind: EntityKind::Enemy,
                fatal: false,
            }),
        ));
        meter
    }

    fn text(reply: Result<Reply, String>) -> String {
        match reply {
            Ok(Reply::Text(text)) => text,
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[test]
    fn quoted_name_is_one_argument() {
        let meter = meter();
        text(respond(r#"name 100 "Iron Wall""#, &meter));
        assert_eq!(meter.store().get_all_users_data()[&100].name, "Iron Wall");
    }

    #[test]
    fn stats_and_skills_print_json() {
        let meter = meter();
        let stats: serde_json::Value = serde_json::from_str(&text(respond("stats", &meter))).unwrap();
        assert_eq!(stats["100"]["total_damage"]["total"], 250);

        let skills: serde_json::Value = serde_json::from_str(&text(respond("skills 100", &meter))).unwrap();
        assert_eq!(skills["7"]["critCount"], 1);

        assert!(respond("skills 999", &meter).is_err());
    }

    #[test]
    fn malformed_input_is_an_error() {
        let meter = meter();
        assert_eq!(respond("name 1 \"unterminated", &meter), Err("error: Invalid quoting".to_string()));
        assert!(respond("explode", &meter).is_err());
        assert!(respond("skills notanumber", &meter).is_err());
    }

    #[test]
    fn pause_twice_is_reported() {
        let meter = meter();
        assert_eq!(text(respond("pause", &meter)), "paused");
        assert_eq!(text(respond("pause", &meter)), "already paused");
        assert_eq!(text(respond("resume", &meter)), "resumed");
    }

    #[test]
    fn me_and_solo() {
        let meter = meter();
        text(respond("me 100", &meter));
        let solo: serde_json::Value = serde_json::from_str(&text(respond("solo", &meter))).unwrap();
        assert!(solo.get("100").is_some());
        text(respond("me", &meter));
        assert_eq!(meter.store().local_player_uid(), None);
    }

    #[test]
    fn quit_ends_the_loop() {
        assert_eq!(respond("quit", &meter()), Ok(Reply::Quit));
    }
}
