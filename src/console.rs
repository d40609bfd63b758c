// ===============================
// src/console.rs
// ===============================
//
// Line commands on stdin. Everything goes through the EngineHandle; the
// console never touches the store directly.
//
use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::engine::{EngineHandle, StatusView};
use crate::error::FlowError;
use crate::persist;
use crate::render;
use crate::resample::Interval;

const TABLE_ROWS: usize = 30;
const CHART_WIDTH: usize = 60;

pub const HELP: &str = "\
commands:
  sub <code>          subscribe
  unsub <code>        unsubscribe
  stop                unsubscribe everything
  filter [codes...]   show only these codes (no args: show all)
  interval <n>        view interval in minutes: 1 3 5 10 30 60
  show [code]         table, newest first
  chart               net value per code
  status              connection, codes, filter
  export <path>       write snapshot JSON
  import <path>       load snapshot JSON (asks for confirmation)
  help
  quit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCmd {
    Sub(String),
    Unsub(String),
    Stop,
    Filter(Vec<String>),
    Interval(Interval),
    Show(Option<String>),
    Chart,
    Status,
    Export(PathBuf),
    Import(PathBuf),
    Help,
    Quit,
}

/// `Ok(None)` for a blank line.
pub fn parse_line(line: &str) -> Result<Option<ConsoleCmd>, String> {
    let mut parts = line.split_whitespace();
    let Some(head) = parts.next() else {
        return Ok(None);
    };
    let rest: Vec<&str> = parts.collect();
    let one = |what: &str| -> Result<String, String> {
        match rest.as_slice() {
            [x] => Ok(x.to_string()),
            _ => Err(format!("usage: {head} <{what}>")),
        }
    };

    let cmd = match head.to_ascii_lowercase().as_str() {
        "sub" | "subscribe" => ConsoleCmd::Sub(one("code")?.to_ascii_uppercase()),
        "unsub" | "unsubscribe" => ConsoleCmd::Unsub(one("code")?.to_ascii_uppercase()),
        "stop" => ConsoleCmd::Stop,
        "filter" => ConsoleCmd::Filter(rest.iter().map(|c| c.to_ascii_uppercase()).collect()),
        "interval" => {
            let n: u32 = one("minutes")?
                .trim_end_matches('m')
                .parse()
                .map_err(|_| "interval must be a number of minutes".to_string())?;
            ConsoleCmd::Interval(Interval::try_from(n).map_err(|e| e.to_string())?)
        }
        "show" => match rest.as_slice() {
            [] => ConsoleCmd::Show(None),
            [c] => ConsoleCmd::Show(Some(c.to_ascii_uppercase())),
            _ => return Err("usage: show [code]".into()),
        },
        "chart" => ConsoleCmd::Chart,
        "status" => ConsoleCmd::Status,
        "export" => ConsoleCmd::Export(PathBuf::from(one("path")?)),
        "import" => ConsoleCmd::Import(PathBuf::from(one("path")?)),
        "help" | "?" => ConsoleCmd::Help,
        "quit" | "exit" | "q" => ConsoleCmd::Quit,
        other => return Err(format!("unknown command {other:?}, try `help`")),
    };
    Ok(Some(cmd))
}

pub fn format_status(s: &StatusView, interval: Interval) -> String {
    let mut out = format!("stream: {}  interval: {}  unsaved: {}\n", s.conn, interval, s.dirty);
    if s.codes.is_empty() {
        out.push_str("no subscriptions\n");
    }
    for (code, name, len) in &s.codes {
        let shown = s.filter.is_empty() || s.filter.contains(code);
        out.push_str(&format!(
            "  {} {:<8} {:<14} {:>4} buckets\n",
            if shown { "*" } else { " " },
            code,
            name,
            len
        ));
    }
    out
}

async fn confirm(lines: &mut Lines<BufReader<Stdin>>) -> bool {
    println!("replace current subscriptions and data? [y/N]");
    matches!(
        lines.next_line().await,
        Ok(Some(answer)) if answer.trim().eq_ignore_ascii_case("y")
    )
}

pub async fn run(engine: EngineHandle, mut interval: Interval, shutdown_tx: Arc<watch::Sender<bool>>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("{HELP}");

    loop {
        let line = match lines.next_line().await {
            Ok(Some(l)) => l,
            Ok(None) => {
                info!("stdin closed, console off");
                return;
            }
            Err(e) => {
                warn!(?e, "stdin read failed, console off");
                return;
            }
        };
        let cmd = match parse_line(&line) {
            Ok(Some(c)) => c,
            Ok(None) => continue,
            Err(msg) => {
                println!("{msg}");
                continue;
            }
        };

        let result = async {
            match cmd {
                ConsoleCmd::Sub(code) => {
                    let name = engine.subscribe(&code).await?;
                    println!("subscribed {code} ({name})");
                }
                ConsoleCmd::Unsub(code) => {
                    engine.unsubscribe(&code).await?;
                    println!("unsubscribed {code}");
                }
                ConsoleCmd::Stop => {
                    engine.unsubscribe_all().await?;
                    println!("all subscriptions stopped");
                }
                ConsoleCmd::Filter(codes) => {
                    let all = codes.is_empty();
                    engine.set_filter(codes).await?;
                    println!("{}", if all { "showing all codes" } else { "filter set" });
                }
                ConsoleCmd::Interval(i) => {
                    interval = i;
                    println!("interval {interval}");
                }
                ConsoleCmd::Show(code) => {
                    let mut view = engine.view(interval).await?;
                    if let Some(code) = &code {
                        view.table.retain(|r| &r.code == code);
                    }
                    print!("{}", render::format_table(&view, TABLE_ROWS));
                }
                ConsoleCmd::Chart => {
                    let view = engine.view(interval).await?;
                    print!("{}", render::format_chart(&view, CHART_WIDTH));
                }
                ConsoleCmd::Status => {
                    print!("{}", format_status(&engine.status().await?, interval));
                }
                ConsoleCmd::Export(path) => {
                    let n = engine.export(path.clone()).await?;
                    println!("exported {n} buckets to {}", path.display());
                }
                ConsoleCmd::Import(path) => {
                    let snap = persist::read_import(&path).await?;
                    println!(
                        "{}: {} codes, {} buckets, saved at {}",
                        path.display(),
                        snap.subscribed_codes.len(),
                        snap.bucket_count(),
                        snap.saved_at.as_deref().unwrap_or("-")
                    );
                    if confirm(&mut lines).await {
                        let n = engine.import(snap).await?;
                        println!("imported, {n} buckets kept for today");
                    } else {
                        println!("import cancelled");
                    }
                }
                ConsoleCmd::Help => println!("{HELP}"),
                ConsoleCmd::Quit => {
                    shutdown_tx.send_replace(true);
                }
            }
            Ok::<(), FlowError>(())
        }
        .await;

        if let Err(e) = result {
            println!("error: {e}");
        }
        if *shutdown_tx.borrow() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ConnStatus;

    #[test]
    fn test_parse_commands() {
        assert_eq!(parse_line("sub 005930"), Ok(Some(ConsoleCmd::Sub("005930".into()))));
        assert_eq!(parse_line("  UNSUB  0000j0 "), Ok(Some(ConsoleCmd::Unsub("0000J0".into()))));
        assert_eq!(parse_line("filter"), Ok(Some(ConsoleCmd::Filter(vec![]))));
        assert_eq!(
            parse_line("filter 005930 000660"),
            Ok(Some(ConsoleCmd::Filter(vec!["005930".into(), "000660".into()])))
        );
        assert_eq!(parse_line("interval 5m"), Ok(Some(ConsoleCmd::Interval(Interval::M5))));
        assert_eq!(parse_line("show"), Ok(Some(ConsoleCmd::Show(None))));
        assert_eq!(
            parse_line("import backup.json"),
            Ok(Some(ConsoleCmd::Import(PathBuf::from("backup.json"))))
        );
        assert_eq!(parse_line("q"), Ok(Some(ConsoleCmd::Quit)));
        assert_eq!(parse_line("   "), Ok(None));
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_line("sub").is_err());
        assert!(parse_line("sub a b").is_err());
        assert!(parse_line("interval 7").is_err());
        assert!(parse_line("interval soon").is_err());
        assert!(parse_line("show a b").is_err());
        assert!(parse_line("buy 005930").is_err());
    }

    #[test]
    fn test_status_marks_visible_codes() {
        let s = StatusView {
            conn: ConnStatus::Connected,
            codes: vec![
                ("005930".into(), "삼성전자".into(), 12),
                ("000660".into(), "SK하이닉스".into(), 3),
            ],
            filter: vec!["000660".into()],
            dirty: false,
        };
        let out = format_status(&s, Interval::M3);
        assert!(out.starts_with("stream: connected  interval: 3m"));
        let lines: Vec<&str> = out.lines().collect();
        assert!(lines[1].starts_with("    005930"));
        assert!(lines[2].starts_with("  * 000660"));
    }
}
