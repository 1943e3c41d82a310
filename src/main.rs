mod cache;
mod clock;
mod config;
mod daemon;
mod document;
mod error;
mod friends;
mod host;
mod insights;
mod models;
mod notify;
mod page;
mod pending;
mod protocol;
mod remote;
mod streak;
mod sync;
#[cfg(test)]
mod testing;
mod tui;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::warn;

use cache::SqliteCache;
use clock::{Clock, SystemClock};
use config::Config;
use error::SyncError;
use models::{ApplicationStats, UserProfile};
use notify::SqliteChannel;
use pending::ReplayOutcome;
use protocol::Message;
use remote::HttpDocumentStore;
use sync::SyncEngine;

type Engine = SyncEngine<SqliteCache, HttpDocumentStore, SqliteChannel>;

#[derive(Parser)]
#[command(name = "streak")]
#[command(about = "Job application streaks - track, sync, and compare daily progress")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in and load stats for a user
    Login {
        /// User id (document id in the remote store)
        uid: String,

        #[arg(short, long)]
        name: Option<String>,

        #[arg(short, long)]
        email: Option<String>,

        #[arg(short, long)]
        photo: Option<String>,
    },

    /// Sign out and clear local data
    Logout,

    /// Show session and sync status
    Status,

    /// Track an application
    Track {
        /// URL of the job posting
        url: String,

        /// Title to record (skips fetching the page)
        #[arg(short, long)]
        title: Option<String>,

        #[arg(short, long)]
        company: Option<String>,

        /// Tag, repeatable
        #[arg(long = "tag")]
        tags: Vec<String>,

        /// Don't fetch the page for title, favicon and company
        #[arg(long)]
        no_fetch: bool,
    },

    /// Remove the last tracked application
    Undo,

    /// Show stats and breakdowns
    Stats {
        /// Number of days in the daily table
        #[arg(short, long, default_value = "7")]
        days: u32,
    },

    /// List recent applications
    Recent {
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Replace local stats with the remote copy
    Pull,

    /// Push local stats to the remote store
    Sync,

    /// Retry a queued remote write
    Retry,

    /// Apply the day rollover if the date changed
    Rollover,

    /// Manage friends
    Friends {
        #[command(subcommand)]
        command: FriendCommands,
    },

    /// Show the streak leaderboard
    Leaderboard,

    /// Live view of stats
    Watch,

    /// Run periodic retries and day-change checks
    Daemon {
        #[arg(long, default_value = "5")]
        retry_minutes: u64,

        #[arg(long, default_value = "60")]
        check_minutes: u64,
    },

    /// Serve the browser extension over native messaging (stdin/stdout)
    Host,

    /// Handle one JSON message and print the response
    Message {
        /// e.g. '{"action":"getStats","userId":"abc"}'
        json: String,
    },
}

#[derive(Subcommand)]
enum FriendCommands {
    /// List friends with their stats
    List,

    /// Add a friend by email
    Add {
        email: String,
    },

    /// Remove a friend by user id
    Remove {
        id: String,
    },
}

fn open_engine(config: &Config) -> Result<Engine> {
    let cache = SqliteCache::open(&config.data_path)
        .with_context(|| format!("Failed to open cache at {}", config.data_path.display()))?;
    let remote = HttpDocumentStore::new(
        &config.remote_url,
        &config.collection,
        config.remote_token.clone(),
        config.remote_timeout,
    )
    .context("Invalid remote store configuration")?;
    let channel = SqliteChannel::open(&config.data_path).context("Failed to open message channel")?;
    Ok(SyncEngine::new(cache, remote, channel, Box::new(SystemClock)))
}

fn signed_in(engine: &Engine) -> Result<UserProfile> {
    engine
        .current_user()?
        .ok_or(SyncError::NotSignedIn)
        .context("Run `streak login <uid>` first")
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}

fn print_summary(stats: &ApplicationStats) {
    println!(
        "Today: {}/{}  Streak: {} days  Total: {}",
        stats.today_count,
        streak::DAILY_GOAL,
        stats.streak,
        stats.total_applications()
    );
}

fn print_pending_note(pending: bool) {
    if pending {
        println!("Saved locally; remote sync is queued and will be retried.");
    }
}

fn describe(outcome: &ReplayOutcome) -> &'static str {
    match outcome {
        ReplayOutcome::Idle => "Nothing queued.",
        ReplayOutcome::Discarded => "Queued sync was stale or no longer applicable; dropped.",
        ReplayOutcome::Pushed => "Queued changes delivered.",
        ReplayOutcome::Pulled => "Caught up from remote.",
        ReplayOutcome::StillPending => "Remote still unreachable; will retry.",
    }
}

/// Startup replay; failures never block the command itself.
fn start(engine: &mut Engine) {
    if let Err(e) = engine.initialize() {
        warn!("startup sync failed: {}", e);
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();
    let config = Config::from_env()?;
    let mut engine = open_engine(&config)?;

    match cli.command {
        Commands::Login {
            uid,
            name,
            email,
            photo,
        } => {
            let stats = engine.sign_in(UserProfile {
                uid: uid.clone(),
                display_name: name,
                email,
                photo_url: photo,
            })?;
            println!("Signed in as {}", uid);
            print_summary(&stats);
            print_pending_note(engine.pending()?.is_some());
        }

        Commands::Logout => {
            engine.sign_out()?;
            println!("Signed out. Local data cleared.");
        }

        Commands::Status => {
            match engine.current_user()? {
                Some(user) => {
                    println!("User: {}", user.uid);
                    if let Some(name) = &user.display_name {
                        println!("Name: {}", name);
                    }
                    if let Some(email) = &user.email {
                        println!("Email: {}", email);
                    }
                }
                None => println!("Not signed in."),
            }
            if let Some(stats) = engine.cached_stats()? {
                print_summary(&stats);
                println!("Last updated: {}", stats.last_updated);
            }
            match engine.pending()? {
                Some(p) => println!(
                    "Pending sync: {} for {} since {}",
                    if p.pull_only { "pull" } else { "push" },
                    p.user_id,
                    p.timestamp
                ),
                None if pending::was_resolved(engine.cache())? => {
                    println!("Pending sync: none (last queued sync delivered)")
                }
                None => println!("Pending sync: none"),
            }
            if let Some(path) = engine.cache().path() {
                println!("Cache: {}", path.display());
            }
            println!("Remote: {}", engine.remote().collection_url());
        }

        Commands::Track {
            url,
            title,
            company,
            tags,
            no_fetch,
        } => {
            signed_in(&engine)?;
            start(&mut engine);
            let mut application = page::capture(&url, title, !no_fetch, config.remote_timeout);
            if company.is_some() {
                application.company = company;
            }
            application.tags = tags;
            let title = application.title.clone();
            let outcome = engine.track(application)?;
            println!("Tracked: {}", truncate(&title, 60));
            print_summary(&outcome.stats);
            print_pending_note(outcome.pending);
        }

        Commands::Undo => {
            start(&mut engine);
            let target = engine
                .cached_stats()?
                .and_then(|stats| stats.last_tracked().map(|job| job.title.clone()));
            match engine.remove_last() {
                Ok(outcome) => {
                    match target {
                        Some(title) => println!("Removed: {}", truncate(&title, 60)),
                        None => println!("Removed last application."),
                    }
                    print_summary(&outcome.stats);
                    print_pending_note(outcome.pending);
                }
                Err(SyncError::NoTrackedEntry) => println!("Nothing to remove."),
                Err(e) => return Err(e.into()),
            }
        }

        Commands::Stats { days } => {
            signed_in(&engine)?;
            let Some(stats) = engine.cached_stats()? else {
                println!("No stats cached. Run `streak pull`.");
                return Ok(());
            };
            print_summary(&stats);
            println!(
                "Goal progress: {:.0}%",
                insights::goal_progress(&stats) * 100.0
            );

            let today = engine.clock().today();
            let counts = insights::daily_counts(&stats, today, days);
            let values: Vec<u32> = counts.iter().map(|(_, n)| *n).collect();
            let averages = insights::moving_average(&values);
            println!();
            println!("{:<12} {:>6} {:>8}", "DATE", "COUNT", "AVG");
            println!("{}", "-".repeat(28));
            for ((day, count), avg) in counts.iter().zip(averages) {
                let avg = avg.map(|a| format!("{:.1}", a)).unwrap_or_else(|| "-".to_string());
                println!("{:<12} {:>6} {:>8}", day, count, avg);
            }

            for (heading, rows) in [
                ("MONTH", insights::by_month(&stats)),
                ("COMPANY", insights::by_company(&stats)),
                ("TAG", insights::by_tag(&stats)),
            ] {
                if rows.is_empty() {
                    continue;
                }
                println!();
                println!("{:<30} {:>6}", heading, "COUNT");
                println!("{}", "-".repeat(37));
                for (name, count) in rows {
                    println!("{:<30} {:>6}", truncate(&name, 28), count);
                }
            }
        }

        Commands::Recent { limit } => {
            let user = signed_in(&engine)?;
            let stats = engine
                .cached_stats()?
                .unwrap_or_else(|| ApplicationStats::new(&user.uid, engine.clock().today()));
            let jobs = insights::recent(&stats, limit);
            if jobs.is_empty() {
                println!("No applications tracked.");
            } else {
                println!("{:<12} {:<40} {:<20}", "DATE", "TITLE", "COMPANY");
                println!("{}", "-".repeat(74));
                for job in jobs {
                    println!(
                        "{:<12} {:<40} {:<20}",
                        job.date,
                        truncate(&job.title, 38),
                        truncate(job.company.as_deref().unwrap_or("-"), 18)
                    );
                }
            }
        }

        Commands::Pull => {
            let user = signed_in(&engine)?;
            let stats = engine.pull_from_remote(&user.uid)?;
            println!("Pulled stats for {}", user.uid);
            print_summary(&stats);
        }

        Commands::Sync => {
            start(&mut engine);
            let pending = engine.sync()?;
            if pending {
                print_pending_note(true);
            } else {
                println!("Stats pushed.");
            }
        }

        Commands::Retry => {
            let outcome = engine.replay_pending()?;
            println!("{}", describe(&outcome));
        }

        Commands::Rollover => {
            start(&mut engine);
            match engine.check_day_change()? {
                Some(outcome) => {
                    println!("Rolled over to {}.", outcome.stats.last_updated);
                    print_summary(&outcome.stats);
                    print_pending_note(outcome.pending);
                }
                None => println!("Already up to date."),
            }
        }

        Commands::Friends { command } => {
            let user = signed_in(&engine)?;
            match command {
                FriendCommands::List => {
                    let friends = friends::list_friends(engine.remote(), &user.uid, engine.clock())?;
                    if friends.is_empty() {
                        println!("No friends yet.");
                    } else {
                        println!("{:<24} {:<24} {:>7} {:>6}", "ID", "NAME", "STREAK", "TODAY");
                        println!("{}", "-".repeat(64));
                        for friend in friends {
                            println!(
                                "{:<24} {:<24} {:>7} {:>6}",
                                truncate(&friend.id, 22),
                                truncate(
                                    friend
                                        .display_name
                                        .as_deref()
                                        .or(friend.email.as_deref())
                                        .unwrap_or("-"),
                                    22
                                ),
                                friend.stats.streak,
                                friend.stats.today_count
                            );
                        }
                    }
                }
                FriendCommands::Add { email } => {
                    let friend = friends::add_friend(engine.remote(), &user.uid, &email, engine.clock())?;
                    println!(
                        "Added {} ({})",
                        friend.display_name.as_deref().unwrap_or(&friend.id),
                        email
                    );
                }
                FriendCommands::Remove { id } => {
                    friends::remove_friend(engine.remote(), &user.uid, &id)?;
                    println!("Removed {}", id);
                }
            }
        }

        Commands::Leaderboard => {
            let user = signed_in(&engine)?;
            let board = friends::leaderboard(engine.remote(), &user.uid, engine.clock())?;
            if board.is_empty() {
                println!("No leaderboard yet.");
            } else {
                println!("{:<4} {:<28} {:>7} {:>6} {:>6}", "#", "NAME", "STREAK", "TODAY", "TOTAL");
                println!("{}", "-".repeat(55));
                for (rank, entry) in board.iter().enumerate() {
                    let marker = if entry.is_current_user { " (you)" } else { "" };
                    println!(
                        "{:<4} {:<28} {:>7} {:>6} {:>6}",
                        rank + 1,
                        truncate(&format!("{}{}", entry.display_name, marker), 28),
                        entry.streak,
                        entry.today_count,
                        entry.total_applications
                    );
                }
            }
        }

        Commands::Watch => {
            start(&mut engine);
            let listener = SqliteChannel::open(&config.data_path)?;
            tui::run_watch(&mut engine, &listener)?;
        }

        Commands::Daemon {
            retry_minutes,
            check_minutes,
        } => {
            println!(
                "Retrying every {} min, checking the date every {} min. Ctrl-C to stop.",
                retry_minutes.max(1),
                check_minutes.max(1)
            );
            daemon::run(engine, daemon::Schedule::from_minutes(retry_minutes, check_minutes))?;
        }

        Commands::Host => {
            start(&mut engine);
            let stdin = std::io::stdin();
            let stdout = std::io::stdout();
            host::serve(&mut engine, &mut stdin.lock(), &mut stdout.lock())?;
        }

        Commands::Message { json } => {
            let message: Message = serde_json::from_str(&json).context("Invalid message JSON")?;
            start(&mut engine);
            let response = engine.handle(message);
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_track_flags() {
        let cli = Cli::parse_from([
            "streak", "track", "https://x.example/job", "--tag", "remote", "--tag", "rust", "--no-fetch",
        ]);
        match cli.command {
            Commands::Track { url, tags, no_fetch, title, .. } => {
                assert_eq!(url, "https://x.example/job");
                assert_eq!(tags, vec!["remote", "rust"]);
                assert!(no_fetch);
                assert!(title.is_none());
            }
            _ => panic!("expected track"),
        }
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("Senior Platform Engineer", 10), "Senior ...");
        assert_eq!(truncate("Ingénieur logiciel", 8), "Ingén...");
    }
}
