use anyhow::Result;
use crossbeam_channel::{tick, Receiver};
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind};
use ratatui::{
    buffer::Buffer,
    layout::Rect,
    style::Stylize,
    symbols::border,
    text::{Line, Text},
    widgets::{Block, Paragraph, Widget},
    DefaultTerminal, Frame,
};
use std::time::Duration;

use crate::{AcquisitionSession, RateMeter, SweepStats};

/// Live acquisition status pane. Drains the sweep-stats channel, draws the
/// run progress and forwards `q` as a clean stop request.
pub struct Status<'a> {
    session: &'a AcquisitionSession,
    meter: RateMeter,
    n_bins: usize,
    n_averages: u32,
    filled_bins: usize,
    out_of_range: u64,
    over_limit: u64,
    stop_requested: bool,
}

impl<'a> Status<'a> {
    pub fn new(session: &'a AcquisitionSession) -> Self {
        let n_bins = session.accumulator().n_bins();
        let n_averages = session.accumulator().n_averages();
        Self {
            session,
            meter: RateMeter::new(),
            n_bins,
            n_averages,
            filled_bins: 0,
            out_of_range: 0,
            over_limit: 0,
            stop_requested: false,
        }
    }

    /// Redraw until the run reaches a terminal state. Returns once the
    /// session has finished; the caller joins and persists the result.
    pub fn run(
        &mut self,
        terminal: &mut DefaultTerminal,
        rx_stats: Receiver<SweepStats>,
    ) -> Result<()> {
        let ticker = tick(Duration::from_millis(250));
        loop {
            let _ = ticker.recv();

            while let Ok(stats) = rx_stats.try_recv() {
                self.meter.increment(stats.shots);
                self.filled_bins = stats.filled_bins;
                self.out_of_range += stats.out_of_range as u64;
                self.over_limit += stats.over_limit as u64;
            }

            self.handle_events()?;

            terminal.draw(|f| self.draw(f))?;

            if self.session.state().is_terminal() {
                return Ok(());
            }
        }
    }

    fn draw(&self, frame: &mut Frame) {
        frame.render_widget(self, frame.area());
    }

    fn handle_events(&mut self) -> Result<()> {
        if event::poll(Duration::ZERO)? {
            match event::read()? {
                Event::Key(key_event) if key_event.kind == KeyEventKind::Press => {
                    self.handle_key_event(key_event)
                }
                _ => {}
            };
        }
        Ok(())
    }

    fn handle_key_event(&mut self, key_event: KeyEvent) {
        if let KeyCode::Char('q') = key_event.code {
            // Cooperative: workers finish their current sweep first.
            self.session.stop();
            self.stop_requested = true;
        }
    }
}

impl Widget for &Status<'_> {
    fn render(self, area: Rect, buf: &mut Buffer) {
        let state = if self.stop_requested && !self.session.state().is_terminal() {
            "stopping".to_string()
        } else {
            self.session.state().to_string()
        };
        let title = Line::from(format!(" FastScan Acquisition [{state}] ").bold());
        let instructions = Line::from(vec![" Stop ".into(), "<Q> ".blue().bold()]);
        let block = Block::bordered()
            .title(title.centered())
            .title_bottom(instructions.centered())
            .border_set(border::THICK);

        let fill_pct = 100.0 * self.filled_bins as f64 / self.n_bins.max(1) as f64;
        let status_text = Text::from(vec![
            Line::from(vec![
                "Elapsed: ".into(),
                self.meter.t_begin.elapsed().as_secs().to_string().yellow(),
                " s".into(),
                "  Sweeps: ".into(),
                self.meter.n_sweeps.to_string().yellow(),
                "  Shot rate: ".into(),
                format!("{:.1}", self.meter.rate()).yellow(),
                " kS/s".into(),
            ]),
            Line::from(vec![
                "Bins at target: ".into(),
                format!("{}/{}", self.filled_bins, self.n_bins).yellow(),
                format!(" ({fill_pct:.1}% of {} avgs)", self.n_averages).into(),
            ]),
            Line::from(vec![
                "Dropped out-of-travel: ".into(),
                self.out_of_range.to_string().yellow(),
                "  past-limit: ".into(),
                self.over_limit.to_string().yellow(),
            ]),
        ]);

        Paragraph::new(status_text)
            .centered()
            .block(block)
            .render(area, buf);
    }
}
