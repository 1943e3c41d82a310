use anyhow::Result;
use chrono::NaiveDate;
use log::debug;
use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
    ExecutableCommand,
};
use ratatui::{
    prelude::*,
    widgets::{BarChart, Block, Borders, List, ListItem, Paragraph, Wrap},
};
use std::io::stdout;
use std::time::Duration;

use crate::cache::LocalCache;
use crate::clock::Clock;
use crate::insights;
use crate::models::{ApplicationStats, UserProfile};
use crate::notify::{Notifier, SqliteChannel};
use crate::protocol::Message;
use crate::remote::DocumentStore;
use crate::streak::DAILY_GOAL;
use crate::sync::{SyncEngine, SyncState};

const POLL_EVERY: Duration = Duration::from_millis(500);
const CHART_DAYS: u32 = 14;

#[derive(Default)]
struct AppState {
    user: Option<UserProfile>,
    stats: Option<ApplicationStats>,
    pending: bool,
    sync: String,
    today: Option<NaiveDate>,
    status: String,
    revision: i64,
}

impl AppState {
    fn reload<C, R, N>(&mut self, engine: &SyncEngine<C, R, N>)
    where
        C: LocalCache,
        R: DocumentStore,
        N: Notifier,
    {
        self.user = engine.current_user().ok().flatten();
        self.stats = engine.cached_stats().ok().flatten();
        self.pending = engine.pending().ok().flatten().is_some();
        self.sync = sync_label(engine.state(), engine.is_connected(), self.pending);
        self.today = Some(engine.clock().today());
        self.revision = engine.cache().revision().unwrap_or(self.revision);
    }

    /// Returns whether the view needs a reload.
    fn apply_signal(&mut self, message: &Message) -> bool {
        match message {
            Message::UserLoggedOut => {
                self.user = None;
                self.stats = None;
                self.pending = false;
                self.status = "Signed out elsewhere".to_string();
                false
            }
            Message::RefreshStats | Message::UserLoggedIn => true,
            _ => false,
        }
    }
}

pub fn run_watch<C, R, N>(engine: &mut SyncEngine<C, R, N>, channel: &SqliteChannel) -> Result<()>
where
    C: LocalCache,
    R: DocumentStore,
    N: Notifier,
{
    let mut state = AppState::default();
    state.reload(engine);

    // Setup terminal
    enable_raw_mode()?;
    stdout().execute(EnterAlternateScreen)?;
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout()))?;

    let result = run_loop(&mut terminal, &mut state, engine, channel);

    // Restore terminal
    disable_raw_mode()?;
    stdout().execute(LeaveAlternateScreen)?;

    result
}

fn run_loop<C, R, N>(
    terminal: &mut Terminal<CrosstermBackend<std::io::Stdout>>,
    state: &mut AppState,
    engine: &mut SyncEngine<C, R, N>,
    channel: &SqliteChannel,
) -> Result<()>
where
    C: LocalCache,
    R: DocumentStore,
    N: Notifier,
{
    let mut subscription = channel.subscribe()?;
    debug!("watching as {}", channel.origin());

    loop {
        terminal.draw(|frame| draw(frame, state))?;

        if event::poll(POLL_EVERY)? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    match key.code {
                        KeyCode::Char('q') | KeyCode::Esc => break,
                        KeyCode::Char('u') => {
                            state.status = match engine.remove_last() {
                                Ok(outcome) if outcome.pending => "Removed (sync pending)".to_string(),
                                Ok(_) => "Removed last application".to_string(),
                                Err(e) => e.to_string(),
                            };
                            state.reload(engine);
                        }
                        KeyCode::Char('r') => {
                            state.status = match state.user.as_ref().map(|u| u.uid.clone()) {
                                Some(uid) => match engine.pull_from_remote(&uid) {
                                    Ok(_) => "Pulled from remote".to_string(),
                                    Err(e) => e.to_string(),
                                },
                                None => "Not signed in".to_string(),
                            };
                            state.reload(engine);
                        }
                        _ => {}
                    }
                }
            }
        }

        let mut reload = false;
        for message in channel.poll(&mut subscription)? {
            reload |= state.apply_signal(&message);
        }
        // Writers that do not broadcast still bump the cache revision.
        if engine.cache().revision().is_ok_and(|rev| rev != state.revision) {
            reload = true;
        }
        if reload {
            state.reload(engine);
        }
    }
    Ok(())
}

fn sync_label(state: SyncState, connected: bool, pending: bool) -> String {
    let label = match state {
        SyncState::Pending => "sync pending",
        SyncState::Dirty => "saving",
        SyncState::Loading => "loading",
        SyncState::Synced | SyncState::Unsynced if pending => "sync pending",
        SyncState::Synced => "synced",
        SyncState::Unsynced => "local",
    };
    if connected {
        label.to_string()
    } else {
        format!("{} (offline)", label)
    }
}

fn card<'a>(title: &'a str, value: String, detail: String, color: Color) -> Paragraph<'a> {
    Paragraph::new(vec![
        Line::from(Span::styled(
            value,
            Style::default().fg(color).add_modifier(Modifier::BOLD),
        )),
        Line::from(Span::styled(detail, Style::default().fg(Color::DarkGray))),
    ])
    .alignment(Alignment::Center)
    .block(Block::default().borders(Borders::ALL).title(title))
}

fn chart_bars(stats: &ApplicationStats, today: NaiveDate) -> Vec<(String, u64)> {
    insights::daily_counts(stats, today, CHART_DAYS)
        .into_iter()
        .map(|(day, count)| (day.format("%d").to_string(), u64::from(count)))
        .collect()
}

fn draw(frame: &mut Frame, state: &AppState) {
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(4),
            Constraint::Length(10),
            Constraint::Min(3),
            Constraint::Length(1),
        ])
        .split(frame.area());

    let help = Paragraph::new(" u:undo last  r:pull from remote  q:quit")
        .style(Style::default().fg(Color::DarkGray));

    let Some(stats) = &state.stats else {
        let message = if state.user.is_some() {
            "No stats cached yet. Press r to pull."
        } else {
            "Not signed in. Run: streak login <uid>"
        };
        frame.render_widget(
            Paragraph::new(message)
                .block(Block::default().borders(Borders::ALL).title(" streak "))
                .wrap(Wrap { trim: false }),
            rows[0].union(rows[2]),
        );
        frame.render_widget(help, rows[3]);
        return;
    };

    let cards = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage(34),
            Constraint::Percentage(33),
            Constraint::Percentage(33),
        ])
        .split(rows[0]);

    let progress = (insights::goal_progress(stats) * 100.0).round();
    frame.render_widget(
        card(
            " Today ",
            format!("{} / {}", stats.today_count, DAILY_GOAL),
            format!("{}% of goal", progress),
            Color::Green,
        ),
        cards[0],
    );
    frame.render_widget(
        card(
            " Streak ",
            format!("{} days", stats.streak),
            format!("since {}", stats.last_updated),
            Color::Yellow,
        ),
        cards[1],
    );
    frame.render_widget(
        card(
            " Total ",
            stats.total_applications().to_string(),
            state.sync.clone(),
            Color::Cyan,
        ),
        cards[2],
    );

    let today = state.today.unwrap_or(stats.last_updated);
    let bars = chart_bars(stats, today);
    let data: Vec<(&str, u64)> = bars.iter().map(|(label, n)| (label.as_str(), *n)).collect();
    let chart = BarChart::default()
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title(format!(" Last {} days ", CHART_DAYS)),
        )
        .data(data.as_slice())
        .bar_width(3)
        .bar_gap(1)
        .bar_style(Style::default().fg(Color::Cyan))
        .value_style(Style::default().fg(Color::Black).bg(Color::Cyan));
    frame.render_widget(chart, rows[1]);

    let items: Vec<ListItem> = insights::recent(stats, 20)
        .into_iter()
        .map(|job| {
            let marker = if job.last_tracked { "*" } else { " " };
            let company = job.company.as_deref().unwrap_or("-");
            ListItem::new(format!("{} {}  {} | {}", marker, job.date, job.title, company))
        })
        .collect();
    let title = match &state.user {
        Some(user) => format!(
            " Recent ({}) {} ",
            user.display_name.as_deref().unwrap_or(&user.uid),
            state.status
        ),
        None => " Recent ".to_string(),
    };
    frame.render_widget(
        List::new(items).block(Block::default().borders(Borders::ALL).title(title)),
        rows[2],
    );
    frame.render_widget(help, rows[3]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logged_out_signal_clears_view() {
        let mut state = AppState {
            user: Some(UserProfile {
                uid: "u1".to_string(),
                display_name: None,
                email: None,
                photo_url: None,
            }),
            stats: Some(ApplicationStats::new("u1", "2024-03-10".parse().unwrap())),
            pending: true,
            ..Default::default()
        };
        assert!(!state.apply_signal(&Message::UserLoggedOut));
        assert!(state.user.is_none());
        assert!(state.stats.is_none());
        assert!(!state.pending);

        assert!(state.apply_signal(&Message::RefreshStats));
        assert!(!state.apply_signal(&Message::SyncStats));
    }

    #[test]
    fn test_sync_label() {
        assert_eq!(sync_label(SyncState::Synced, true, false), "synced");
        assert_eq!(sync_label(SyncState::Unsynced, true, true), "sync pending");
        assert_eq!(sync_label(SyncState::Pending, false, true), "sync pending (offline)");
    }

    #[test]
    fn test_chart_covers_two_weeks() {
        let stats = ApplicationStats::new("u1", "2024-03-10".parse().unwrap());
        let bars = chart_bars(&stats, "2024-03-10".parse().unwrap());
        assert_eq!(bars.len(), 14);
        assert_eq!(bars.first().map(|(d, _)| d.as_str()), Some("26"));
        assert_eq!(bars.last().map(|(d, _)| d.as_str()), Some("10"));
        assert!(bars.iter().all(|(_, n)| *n == 0));
    }
}
