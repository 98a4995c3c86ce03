use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::{Backend, CrosstermBackend},
    layout::{Constraint, Direction, Layout},
    style::{Color, Style},
    symbols,
    text::Span,
    widgets::{Axis, Block, Borders, Chart, Dataset, GraphType},
    Frame, Terminal,
};
use std::{
    f64::consts::PI,
    io,
    sync::mpsc::{Receiver, TryRecvError},
    sync::Arc,
    time::{Duration, Instant},
};

use crate::gui::MonitorError;
use crate::pipeline::{PipelineContext, TrackingReport};
use crate::tracker::TrackerError;

/// What one chart shows.
#[derive(Debug, Clone, Default, PartialEq)]
struct TrackView {
    title: String,
    particles: Vec<(f64, f64)>,
    estimate: Vec<(f64, f64)>,
}

/// The monitor's state: the latest report, reshaped for plotting.
#[derive(Debug, Default)]
pub struct MonitorApp {
    frame_limit: Option<u64>,
    reports_seen: u64,
    gated: bool,
    max_weight: f64,
    views: Vec<TrackView>,
}

impl MonitorApp {
    pub fn new(frame_limit: Option<u64>) -> MonitorApp {
        MonitorApp {
            frame_limit,
            ..Default::default()
        }
    }

    pub fn reports_seen(&self) -> u64 {
        self.reports_seen
    }

    pub fn limit_reached(&self) -> bool {
        self.frame_limit.map_or(false, |limit| self.reports_seen >= limit)
    }

    /// Folds in the newest report.
    pub fn on_report(&mut self, report: &TrackingReport) {
        self.reports_seen += 1;
        self.gated = report.gated;
        let max_weight = report
            .tracks
            .iter()
            .flat_map(|t| t.particles.iter().map(|&(_, w)| w))
            .fold(0.0, f64::max);
        // only ever grow the y axis, so the charts do not jitter
        self.max_weight = self.max_weight.max(max_weight);
        let top = self.y_bound();
        self.views = report
            .tracks
            .iter()
            .map(|track| TrackView {
                title: format!(
                    " outlier p = {:.3} | az {:6.1}° | frame {} ",
                    track.outlier_prob,
                    track.azimuth.to_degrees(),
                    report.frame
                ),
                particles: track.particles.clone(),
                estimate: vec![(track.azimuth, 0.0), (track.azimuth, top)],
            })
            .collect();
    }

    fn y_bound(&self) -> f64 {
        if self.max_weight > 0.0 {
            self.max_weight * 1.1
        } else {
            1.0
        }
    }
}

/// Plots each tracker's particles until `q` is pressed, the frame limit is
/// reached, or the report channel closes. Pressing `q` cancels `ctx`.
/// Returns the number of reports shown.
pub fn engage_monitor(
    reports: Receiver<Result<TrackingReport, TrackerError>>,
    ctx: Arc<PipelineContext>,
    frame_limit: Option<u64>,
) -> Result<u64, MonitorError> {
    // setup terminal
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let tick_rate = Duration::from_millis(100);
    let mut app = MonitorApp::new(frame_limit);
    let res = run_app(&mut terminal, &mut app, &reports, &ctx, tick_rate);

    // restore terminal
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    res.map(|()| app.reports_seen())
}

fn run_app<B: Backend>(
    terminal: &mut Terminal<B>,
    app: &mut MonitorApp,
    reports: &Receiver<Result<TrackingReport, TrackerError>>,
    ctx: &PipelineContext,
    tick_rate: Duration,
) -> Result<(), MonitorError> {
    let mut last_tick = Instant::now();
    loop {
        terminal.draw(|f| ui(f, app))?;

        let timeout = tick_rate
            .checked_sub(last_tick.elapsed())
            .unwrap_or_else(|| Duration::from_secs(0));
        if event::poll(timeout)? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press && key.code == KeyCode::Char('q') {
                    ctx.cancel();
                    return Ok(());
                }
            }
        }
        if last_tick.elapsed() >= tick_rate {
            loop {
                match reports.try_recv() {
                    Ok(report) => app.on_report(&report?),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => return Ok(()),
                }
                if app.limit_reached() {
                    return Ok(());
                }
            }
            last_tick = Instant::now();
        }
    }
}

fn ui(f: &mut Frame, app: &MonitorApp) {
    let n = app.views.len().max(1) as u32;
    let areas = Layout::default()
        .direction(Direction::Vertical)
        .constraints(vec![Constraint::Ratio(1, n); n as usize])
        .split(f.size());

    let top = app.y_bound();
    let y_labels: Vec<Span> = [0.0, top / 2.0, top]
        .iter()
        .map(|w| Span::from(format!("{:.3}", w)))
        .collect();

    for (view, area) in app.views.iter().zip(areas.iter()) {
        let chart = Chart::new(vec![
            Dataset::default()
                .name("particles")
                .marker(symbols::Marker::Dot)
                .graph_type(GraphType::Scatter)
                .style(Style::default().fg(Color::Cyan))
                .data(&view.particles),
            Dataset::default()
                .name("estimate")
                .marker(symbols::Marker::Braille)
                .graph_type(GraphType::Line)
                .style(Style::default().fg(if app.gated { Color::DarkGray } else { Color::Red }))
                .data(&view.estimate),
        ])
        .block(Block::default().title(view.title.as_str()).borders(Borders::ALL))
        .x_axis(
            Axis::default()
                .title(Span::styled("azimuth", Style::default().fg(Color::Red)))
                .style(Style::default().fg(Color::White))
                .bounds([0.0, PI])
                .labels(["0°", "90°", "180°"].iter().cloned().map(Span::from).collect()),
        )
        .y_axis(
            Axis::default()
                .title(Span::styled("weight", Style::default().fg(Color::Red)))
                .style(Style::default().fg(Color::White))
                .bounds([0.0, top])
                .labels(y_labels.clone()),
        );
        f.render_widget(chart, *area);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::TrackEstimate;
    use crate::vector::Vec3;
    use ratatui::backend::TestBackend;

    fn report(frame: u64, weights: &[f64]) -> TrackingReport {
        let track = TrackEstimate {
            outlier_prob: 0.2,
            direction: Vec3::new(0.0, 1.0, 0.0),
            azimuth: PI / 2.0,
            polar: PI / 2.0,
            beam_index: 50,
            location: None,
            plane_coords: None,
            particles: weights.iter().map(|&w| (PI / 2.0, w)).collect(),
        };
        TrackingReport {
            frame,
            energy: 1.0,
            gated: false,
            tracks: vec![track.clone(), track],
        }
    }

    #[test]
    fn app_follows_reports() {
        let mut app = MonitorApp::new(Some(2));
        app.on_report(&report(0, &[0.25, 0.75]));
        assert!(!app.limit_reached());
        assert_eq!(app.views.len(), 2);
        assert_eq!(app.views[0].particles.len(), 2);
        assert!((app.y_bound() - 0.825).abs() < 1e-12);

        // a flatter posterior does not shrink the axis
        app.on_report(&report(1, &[0.5, 0.5]));
        assert!((app.y_bound() - 0.825).abs() < 1e-12);
        assert!(app.limit_reached());
        assert_eq!(app.reports_seen(), 2);
        assert!(app.views[1].title.contains("frame 1"));
    }

    #[test]
    fn renders_without_a_terminal() {
        let mut terminal = Terminal::new(TestBackend::new(80, 30)).unwrap();
        let mut app = MonitorApp::new(None);
        terminal.draw(|f| ui(f, &app)).unwrap();
        app.on_report(&report(0, &[0.1, 0.9]));
        terminal.draw(|f| ui(f, &app)).unwrap();
    }
}
