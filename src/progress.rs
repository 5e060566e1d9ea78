use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

/// Segment progress counter. Cheap to clone, all clones share the same counter.
#[derive(Clone)]
pub struct Progress {
    bar: ProgressBar,
}

impl Progress {
    /// Progress bar drawn on stderr
    #[must_use]
    pub fn visible() -> Self {
        let bar = ProgressBar::new(0);
        if let Ok(style) = ProgressStyle::with_template(
            "[{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} segments ({eta})",
        ) {
            bar.set_style(style.progress_chars("=> "));
        }
        Self { bar }
    }

    /// Counter that is never drawn
    #[must_use]
    pub fn hidden() -> Self {
        let bar = ProgressBar::with_draw_target(Some(0), ProgressDrawTarget::hidden());
        Self { bar }
    }

    /// Grows the expected total, used when a live playlist gains segments
    pub fn add_total(&self, amount: usize) {
        self.bar.inc_length(amount as u64);
    }

    pub fn advance(&self) {
        self.bar.inc(1);
    }

    pub fn advance_by(&self, amount: usize) {
        self.bar.inc(amount as u64);
    }

    #[must_use]
    pub fn position(&self) -> u64 {
        self.bar.position()
    }

    #[must_use]
    pub fn total(&self) -> u64 {
        self.bar.length().unwrap_or(0)
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}
