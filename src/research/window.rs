use crate::research::model::WalkForwardSpec;
use chrono::{Months, NaiveDate};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Window {
    pub train_start: NaiveDate,
    pub train_end: NaiveDate,
    pub test_start: NaiveDate,
    pub test_end: NaiveDate,
}

/// Lazy rolling-window generator. Month arithmetic clamps to the last day of
/// shorter months (Jan 31 + 1 month = Feb 28).
#[derive(Debug, Clone)]
pub struct WindowIter {
    cursor: Option<NaiveDate>,
    end: NaiveDate,
    train: Months,
    test: Months,
    step: Months,
}

pub fn windows(start: NaiveDate, end: NaiveDate, wf: &WalkForwardSpec) -> WindowIter {
    WindowIter {
        cursor: Some(start),
        end,
        train: Months::new(wf.train_months),
        test: Months::new(wf.test_months),
        step: Months::new(wf.step_months),
    }
}

impl Iterator for WindowIter {
    type Item = Window;

    fn next(&mut self) -> Option<Window> {
        let train_start = self.cursor.take()?;
        let train_end = train_start.checked_add_months(self.train)?;
        let test_start = train_end;
        if test_start >= self.end {
            return None;
        }
        let test_end = test_start
            .checked_add_months(self.test)
            .map_or(self.end, |d| d.min(self.end));

        self.cursor = train_start
            .checked_add_months(self.step)
            .filter(|next| *next < self.end);

        Some(Window {
            train_start,
            train_end,
            test_start,
            test_end,
        })
    }
}
