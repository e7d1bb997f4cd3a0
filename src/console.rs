//! Line-oriented session console behind `vibelock recommend`.
//!
//! Every input line is one command. Output goes to any `Write`, so the loop runs the
//! same against a terminal or a test buffer.

use crate::engine::{Engine, SessionId};
use crate::feedback::Feedback;
use crate::queue::Pick;
use anyhow::{Context, Result};
use log::{info, warn};
use std::io::{BufRead, Write};

const HELP: &str = "Commands: next | batch [n] | play <id> <secs> | like <id> [secs] | \
dislike <id> | seed <id> | search <query> | reset | state | quit";

#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Next,
    Batch(Option<usize>),
    Play { track_id: String, seconds: f64 },
    Like { track_id: String, seconds: Option<f64> },
    Dislike(String),
    Seed(String),
    Search(String),
    Reset,
    State,
    Help,
    Quit,
    Empty,
    Unrecognized(String),
}

/// Parse one input line. Malformed arguments come back as `Unrecognized`.
#[must_use]
pub fn parse_command(line: &str) -> ConsoleCommand {
    let line = line.trim();
    let (verb, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let rest = rest.trim();
    let mut args = rest.split_whitespace();

    let command = match verb.to_lowercase().as_str() {
        "" => Some(ConsoleCommand::Empty),
        "next" | "n" => Some(ConsoleCommand::Next),
        "batch" | "b" => match args.next() {
            None => Some(ConsoleCommand::Batch(None)),
            Some(n) => n.parse().ok().map(|n| ConsoleCommand::Batch(Some(n))),
        },
        "play" | "p" => match (args.next(), args.next().and_then(|s| s.parse().ok())) {
            (Some(id), Some(seconds)) => Some(ConsoleCommand::Play { track_id: id.to_string(), seconds }),
            _ => None,
        },
        "like" | "l" => args.next().and_then(|id| match args.next() {
            None => Some(ConsoleCommand::Like { track_id: id.to_string(), seconds: None }),
            Some(s) => s
                .parse()
                .ok()
                .map(|seconds| ConsoleCommand::Like { track_id: id.to_string(), seconds: Some(seconds) }),
        }),
        "dislike" | "d" => args.next().map(|id| ConsoleCommand::Dislike(id.to_string())),
        "seed" => args.next().map(|id| ConsoleCommand::Seed(id.to_string())),
        "search" | "s" if !rest.is_empty() => Some(ConsoleCommand::Search(rest.to_string())),
        "reset" => Some(ConsoleCommand::Reset),
        "state" => Some(ConsoleCommand::State),
        "help" | "?" => Some(ConsoleCommand::Help),
        "quit" | "exit" | "stop" | "q" => Some(ConsoleCommand::Quit),
        _ => None,
    };
    command.unwrap_or_else(|| ConsoleCommand::Unrecognized(line.to_string()))
}

fn print_pick(out: &mut dyn Write, pick: &Pick) -> Result<()> {
    let cluster = pick.cluster_id.map_or_else(|| "-".to_string(), |c| c.to_string());
    writeln!(
        out,
        "{:<8} {:<24} {:<40} cluster {:>3}  score {:.3}  {}",
        pick.phase.to_string(),
        pick.track_id,
        pick.label,
        cluster,
        pick.score,
        pick.justification
    )?;
    Ok(())
}

fn send_feedback(engine: &Engine, session: SessionId, feedback: Feedback, out: &mut dyn Write) -> Result<()> {
    let track_id = feedback.track_id.clone();
    match engine.feedback(session, feedback)? {
        Some(outcome) => writeln!(
            out,
            "{track_id}: {} ({:.0}% of {:.0}s) -> {:?}",
            outcome.signal(),
            outcome.classification.percent * 100.0,
            outcome.classification.total_seconds,
            outcome.transition
        )?,
        None => writeln!(out, "Unknown track {track_id}")?,
    }
    Ok(())
}

/// Run one command. Returns `false` when the session should end.
pub fn execute(engine: &Engine, session: SessionId, command: ConsoleCommand, out: &mut dyn Write) -> Result<bool> {
    match command {
        ConsoleCommand::Next => match engine.next(session)? {
            Some(pick) => print_pick(out, &pick)?,
            None => writeln!(out, "Nothing left to recommend. Try 'reset'.")?,
        },
        ConsoleCommand::Batch(n) => {
            let n = n.unwrap_or(engine.config().queue.batch_size);
            let picks = engine.next_batch(session, n)?;
            if picks.is_empty() {
                writeln!(out, "Nothing left to recommend. Try 'reset'.")?;
            }
            for pick in &picks {
                print_pick(out, pick)?;
            }
        }
        ConsoleCommand::Play { track_id, seconds } => {
            send_feedback(engine, session, Feedback::listened(track_id, seconds), out)?;
        }
        ConsoleCommand::Like { track_id, seconds } => {
            let seconds = seconds.unwrap_or(engine.config().feedback.liked_secs);
            send_feedback(engine, session, Feedback::listened(track_id, seconds).like(), out)?;
        }
        ConsoleCommand::Dislike(track_id) => {
            send_feedback(engine, session, Feedback::listened(track_id, 0.0).dislike(), out)?;
        }
        ConsoleCommand::Seed(track_id) => match engine.seed(session, &track_id)? {
            Some(pick) => print_pick(out, &pick)?,
            None => writeln!(out, "Unknown track {track_id}")?,
        },
        ConsoleCommand::Search(query) => {
            let hits = engine.search(session, &query)?;
            if hits.is_empty() {
                writeln!(out, "No match for '{query}'")?;
            }
            for hit in hits {
                writeln!(out, "{:<24} {}", hit.id, hit.label)?;
            }
        }
        ConsoleCommand::Reset => {
            engine.reset(session)?;
            writeln!(out, "Session reset")?;
        }
        ConsoleCommand::State => {
            let summary = engine.inspect(session, |s| {
                let state = s.state();
                format!(
                    "streak {} | successes {} | fails {} | drift {:.2} | cluster {:?} | likes {} | played {}",
                    state.streak,
                    state.cluster_consecutive_success,
                    state.cluster_fail_count,
                    state.exploration_drift,
                    state.current_cluster_id,
                    state.session_likes.len(),
                    state.played_ids.len()
                )
            })?;
            writeln!(out, "{summary}")?;
        }
        ConsoleCommand::Help => writeln!(out, "{HELP}")?,
        ConsoleCommand::Quit => return Ok(false),
        ConsoleCommand::Empty => {}
        ConsoleCommand::Unrecognized(line) => {
            warn!("Unrecognized command: {line}");
            writeln!(out, "Unrecognized command. {HELP}")?;
        }
    }
    Ok(true)
}

/// Read commands from `input` until `quit` or end of input.
pub fn run<R: BufRead>(engine: &Engine, session: SessionId, input: R, out: &mut dyn Write) -> Result<()> {
    writeln!(out, "{HELP}")?;
    for line in input.lines() {
        let line = line.context("Failed to read command")?;
        if !execute(engine, session, parse_command(&line), out)? {
            break;
        }
        out.flush()?;
    }
    info!("Console for session {session} closed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::db::MemoryAffinityStore;
    use crate::library::{AvailabilityMode, MemoryLibrarySource, Track};
    use std::io::Cursor;
    use std::sync::Arc;

    #[test]
    fn test_parse_commands() {
        assert_eq!(parse_command("next"), ConsoleCommand::Next);
        assert_eq!(parse_command("  batch 3 "), ConsoleCommand::Batch(Some(3)));
        assert_eq!(parse_command("batch"), ConsoleCommand::Batch(None));
        assert_eq!(
            parse_command("play t1 42.5"),
            ConsoleCommand::Play { track_id: "t1".to_string(), seconds: 42.5 }
        );
        assert_eq!(parse_command("like t2"), ConsoleCommand::Like { track_id: "t2".to_string(), seconds: None });
        assert_eq!(parse_command("search blue in green"), ConsoleCommand::Search("blue in green".to_string()));
        assert_eq!(parse_command("QUIT"), ConsoleCommand::Quit);
        assert_eq!(parse_command(""), ConsoleCommand::Empty);
    }

    #[test]
    fn test_malformed_arguments_are_unrecognized() {
        assert!(matches!(parse_command("play t1"), ConsoleCommand::Unrecognized(_)));
        assert!(matches!(parse_command("play t1 soon"), ConsoleCommand::Unrecognized(_)));
        assert!(matches!(parse_command("batch many"), ConsoleCommand::Unrecognized(_)));
        assert!(matches!(parse_command("dance"), ConsoleCommand::Unrecognized(_)));
    }

    #[test]
    fn test_run_script() -> Result<()> {
        let tracks = (0..6)
            .map(|i| {
                let mut v = vec![0.2; 3];
                v[i % 3] = 1.0 + i as f64 * 0.1;
                Track::new(format!("t{i}"), format!("Track {i}"), v)
            })
            .collect();
        let mut config = EngineConfig::default().with_seed(1);
        config.cluster.k = 2;
        let engine = Engine::builder(
            Arc::new(MemoryLibrarySource::new().with_collection("default", tracks)),
            Arc::new(MemoryAffinityStore::new()),
        )
        .with_config(config)
        .build();
        let session = engine.create_session("guest", "default", AvailabilityMode::Any)?;

        let script = "seed t0\nnext\nplay t1 200\nstate\nsearch track 5\nbogus\nquit\nnext\n";
        let mut out = Vec::new();
        run(&engine, session, Cursor::new(script), &mut out)?;
        let text = String::from_utf8(out).expect("Console output should be UTF-8");

        assert!(text.contains("Seeded by you"));
        assert!(text.contains("t1: finished"), "Play feedback should be classified: {text}");
        assert!(text.contains("streak"));
        assert!(text.contains("Track 5"));
        assert!(text.contains("Unrecognized command"));
        assert_eq!(text.matches("score ").count(), 2, "The next after quit never runs");
        let (seeded, listened) = engine.inspect(session, |s| {
            (s.state().played_ids.contains("t0"), s.state().played_ids.contains("t1"))
        })?;
        assert!(seeded && listened, "Seed and play both mark tracks played");
        Ok(())
    }
}
