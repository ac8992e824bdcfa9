use crate::engine::{HostView, SyncEngine};
use crate::format::{format_percentage, format_time_ago, StatusLevel};
use crate::liveness::Liveness;
use crate::push::ConnectionState;
use crate::roster::Roster;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::info;

pub const DEFAULT_RENDER_INTERVAL: Duration = Duration::from_millis(2000);

pub fn render_frame(
    views: &[HostView],
    roster: &Roster,
    connection: Option<ConnectionState>,
    now: DateTime<Utc>,
) -> Vec<String> {
    let online = views
        .iter()
        .filter(|v| v.liveness == Liveness::Online)
        .count();
    let push = match connection {
        Some(state) if state.is_degraded() => "push degraded, polling only".to_string(),
        Some(state) => format!("push {state}"),
        None => "push disabled".to_string(),
    };

    let mut lines = Vec::with_capacity(views.len() + 1);
    lines.push(format!("{online}/{} hosts online | {push}", views.len()));
    for view in views {
        lines.push(render_host(view, &roster.display_name(&view.id), now));
    }
    lines
}

pub fn render_host(view: &HostView, name: &str, now: DateTime<Utc>) -> String {
    let Some(sample) = &view.latest else {
        return format!("  {name:<24} {:<7} no data", view.liveness.as_str());
    };

    let worst = [sample.cpu(), sample.ram(), sample.disk()]
        .into_iter()
        .chain(sample.gpu())
        .fold(0.0_f64, f64::max);
    format!(
        "{} {name:<24} {:<7} cpu {:>6} ram {:>6} disk {:>6} gpu {:>6}  {}",
        StatusLevel::from_value(worst).marker(),
        view.liveness.as_str(),
        format_percentage(Some(sample.cpu())),
        format_percentage(Some(sample.ram())),
        format_percentage(Some(sample.disk())),
        format_percentage(sample.gpu()),
        format_time_ago(sample.timestamp, now),
    )
}

pub async fn run_render_loop(
    engine: Arc<SyncEngine>,
    roster: Arc<Roster>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("render loop stopping");
                break;
            }
            _ = ticker.tick() => {
                let frame = render_frame(
                    &engine.snapshot(),
                    &roster,
                    engine.connection_state(),
                    Utc::now(),
                );
                println!("{}", frame.join("\n"));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::sample_at;
    use crate::model::{EntityId, RosterEntry};
    use chrono::TimeZone;

    fn view(id: &str, liveness: Liveness, latest_secs: Option<i64>) -> HostView {
        HostView {
            id: EntityId::from(id),
            liveness,
            latest: latest_secs.map(|s| sample_at(id, s)),
            window_len: usize::from(latest_secs.is_some()),
        }
    }

    #[test]
    fn frame_has_summary_and_one_line_per_host() {
        let roster = Roster::new();
        roster.replace(vec![RosterEntry {
            id: EntityId::from("a"),
            hostname: "alpha".to_string(),
            last_seen: String::new(),
            version: None,
        }]);
        let now = Utc.timestamp_opt(100, 0).unwrap();
        let frame = render_frame(
            &[
                view("a", Liveness::Online, Some(95)),
                view("b", Liveness::Offline, None),
            ],
            &roster,
            Some(ConnectionState::Closed { degraded: true }),
            now,
        );

        assert_eq!(frame.len(), 3);
        assert_eq!(frame[0], "1/2 hosts online | push degraded, polling only");
        assert!(frame[1].contains("alpha"));
        assert!(frame[1].contains("cpu  10.0%"));
        assert!(frame[1].ends_with("5 seconds ago"));
        assert!(frame[2].contains("b"));
        assert!(frame[2].ends_with("no data"));
    }

    #[test]
    fn hot_host_gets_marker() {
        let now = Utc.timestamp_opt(100, 0).unwrap();
        let mut hot = view("h", Liveness::Online, Some(100));
        if let Some(sample) = hot.latest.as_mut() {
            sample.disk = 95.0;
        }
        assert!(render_host(&hot, "h", now).starts_with('‼'));
        assert!(render_host(&view("c", Liveness::Online, Some(100)), "c", now).starts_with(' '));
    }

    #[test]
    fn open_channel_is_shown() {
        let frame = render_frame(&[], &Roster::new(), Some(ConnectionState::Open), Utc::now());
        assert_eq!(frame[0], "0/0 hosts online | push open");
    }
}
