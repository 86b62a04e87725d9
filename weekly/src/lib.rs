//! Weekly planning notes: one Markdown file per ISO week.
//!
//! A week holds day sections made of time blocks (tasks and free-form notes) followed by a
//! fixed "3Ps" retrospective (Progress / Planned / Problems). The library keeps the core
//! pure: text goes in through `parser`, edits happen on the in-memory `WeekDocument`
//! through `schedule` and `ops`, and `format` renders the canonical text back out.
//! Filesystem concerns live in `storage` and `template`.

pub mod core {
    use chrono::{NaiveDate, NaiveTime, Timelike};
    use indexmap::IndexMap;
    use serde::{Deserialize, Serialize};
    use std::{
        fmt, io,
        path::{Path, PathBuf},
        str::FromStr,
    };

    pub type Result<T> = std::result::Result<T, WeeklyError>;

    /* ------------------------------ Aggregate ------------------------------ */

    /// Aggregate root: the contents of one weekly file.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct WeekDocument {
        /// Raw lines preceding the first section header, blank lines included.
        #[serde(default)]
        pub extra_lines: Vec<String>,

        /// Day sections in the order they were first encountered.
        #[serde(default)]
        pub days: IndexMap<NaiveDate, DayRecord>,

        #[serde(default)]
        pub three_p: ThreeP,
    }

    impl WeekDocument {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn day(&self, date: NaiveDate) -> Option<&DayRecord> {
            self.days.get(&date)
        }

        pub fn day_mut(&mut self, date: NaiveDate) -> Option<&mut DayRecord> {
            self.days.get_mut(&date)
        }

        /// Day record for `date`, appended empty at the end of the week when absent.
        pub fn day_or_insert(&mut self, date: NaiveDate) -> &mut DayRecord {
            self.days.entry(date).or_default()
        }
    }

    /* ------------------------------ Entities ------------------------------ */

    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct DayRecord {
        /// Ascending by start time, non-overlapping.
        #[serde(default)]
        pub blocks: Vec<TimeBlock>,
        /// Day-level notes. Never produced by the parser, kept for the model's sake.
        #[serde(default)]
        pub notes: Vec<String>,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct TimeBlock {
        pub start: NaiveTime,
        pub end: NaiveTime,
        #[serde(default)]
        pub tasks: Vec<Task>,
        /// Raw note lines, stored verbatim (usually `- ...` bullets).
        #[serde(default)]
        pub notes: Vec<String>,
    }

    impl TimeBlock {
        pub fn new(range: TimeRange) -> Self {
            Self {
                start: range.start,
                end: range.end,
                tasks: vec![],
                notes: vec![],
            }
        }

        pub fn range(&self) -> TimeRange {
            TimeRange {
                start: self.start,
                end: self.end,
            }
        }

        /// Inclusive on both ends.
        pub fn contains(&self, t: NaiveTime) -> bool {
            self.start <= t && t <= self.end
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Task {
        pub text: String,
        pub status: Status,
    }

    impl Task {
        pub fn new(text: &str, status: Status) -> Self {
            Self {
                text: text.trim().to_string(),
                status,
            }
        }

        pub fn pending(text: &str) -> Self {
            Self::new(text, Status::Pending)
        }
    }

    /* ---------------------------- Value objects ---------------------------- */

    /// Task state, one-to-one with the checkbox markers ` `, `x` and `~`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum Status {
        Pending,
        Done,
        Canceled,
    }

    impl Status {
        pub fn marker(self) -> char {
            match self {
                Status::Pending => ' ',
                Status::Done => 'x',
                Status::Canceled => '~',
            }
        }

        pub fn from_marker(marker: char) -> Option<Self> {
            match marker {
                ' ' => Some(Status::Pending),
                'x' => Some(Status::Done),
                '~' => Some(Status::Canceled),
                _ => None,
            }
        }

        pub fn as_str(self) -> &'static str {
            match self {
                Status::Pending => "pending",
                Status::Done => "done",
                Status::Canceled => "canceled",
            }
        }
    }

    impl fmt::Display for Status {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.as_str())
        }
    }

    impl FromStr for Status {
        type Err = WeeklyError;

        fn from_str(s: &str) -> Result<Self> {
            match s.trim().to_ascii_lowercase().as_str() {
                "pending" => Ok(Status::Pending),
                "done" => Ok(Status::Done),
                "canceled" => Ok(Status::Canceled),
                _ => Err(WeeklyError::InvalidStatus(s.to_string())),
            }
        }
    }

    /// One of the three fixed retrospective buckets.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum ThreePSection {
        Progress,
        Planned,
        Problems,
    }

    impl ThreePSection {
        /// Rendering order.
        pub const ALL: [ThreePSection; 3] = [
            ThreePSection::Progress,
            ThreePSection::Planned,
            ThreePSection::Problems,
        ];

        /// Case-insensitive name lookup.
        pub fn from_name(name: &str) -> Result<Self> {
            match name.trim().to_ascii_lowercase().as_str() {
                "progress" => Ok(ThreePSection::Progress),
                "planned" => Ok(ThreePSection::Planned),
                "problems" => Ok(ThreePSection::Problems),
                _ => Err(WeeklyError::InvalidSection(name.to_string())),
            }
        }

        /// Header text as written in the file.
        pub fn title(self) -> &'static str {
            match self {
                ThreePSection::Progress => "Progress",
                ThreePSection::Planned => "Planned",
                ThreePSection::Problems => "Problems",
            }
        }
    }

    impl FromStr for ThreePSection {
        type Err = WeeklyError;

        fn from_str(s: &str) -> Result<Self> {
            Self::from_name(s)
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct ThreeP {
        #[serde(default)]
        pub progress: Vec<String>,
        #[serde(default)]
        pub planned: Vec<String>,
        #[serde(default)]
        pub problems: Vec<String>,
    }

    impl ThreeP {
        pub fn bucket(&self, section: ThreePSection) -> &Vec<String> {
            match section {
                ThreePSection::Progress => &self.progress,
                ThreePSection::Planned => &self.planned,
                ThreePSection::Problems => &self.problems,
            }
        }

        pub fn bucket_mut(&mut self, section: ThreePSection) -> &mut Vec<String> {
            match section {
                ThreePSection::Progress => &mut self.progress,
                ThreePSection::Planned => &mut self.planned,
                ThreePSection::Problems => &mut self.problems,
            }
        }
    }

    /// A same-day interval with `start < end`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct TimeRange {
        pub start: NaiveTime,
        pub end: NaiveTime,
    }

    impl TimeRange {
        pub fn new(start: NaiveTime, end: NaiveTime) -> Result<Self> {
            if start < end {
                Ok(Self { start, end })
            } else {
                Err(WeeklyError::InvalidInterval { start, end })
            }
        }
    }

    impl fmt::Display for TimeRange {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(
                f,
                "{} - {}",
                self.start.format("%H:%M"),
                self.end.format("%H:%M")
            )
        }
    }

    /// The file format only carries minutes.
    pub fn truncate_to_minute(t: NaiveTime) -> NaiveTime {
        NaiveTime::from_hms_opt(t.hour(), t.minute(), 0).unwrap_or(t)
    }

    /* ------------------------------- Errors ------------------------------- */

    #[derive(Debug, thiserror::Error)]
    pub enum WeeklyError {
        #[error("invalid weekly note at line {line}: {reason}")]
        InvalidDocument { line: usize, reason: String },
        #[error("no section for {0} in the weekly note")]
        DayNotFound(NaiveDate),
        #[error("no time block on {date} at or after {}", .time.format("%H:%M"))]
        BlockNotFound { date: NaiveDate, time: NaiveTime },
        #[error("no task `{text}` on {date}")]
        TaskNotFound { date: NaiveDate, text: String },
        #[error("task index {index} is out of range (the block has {len} tasks)")]
        IndexOutOfRange { index: usize, len: usize },
        #[error("invalid status `{0}` (expected pending, done or canceled)")]
        InvalidStatus(String),
        #[error("invalid 3P section `{0}` (expected progress, planned or problems)")]
        InvalidSection(String),
        #[error(
            "invalid interval {} - {}: start must be before end",
            .start.format("%H:%M"),
            .end.format("%H:%M")
        )]
        InvalidInterval { start: NaiveTime, end: NaiveTime },
        #[error("cannot store `{text}`: {reason}")]
        InvalidText { text: String, reason: &'static str },
        #[error("weekly note {0:?} does not exist")]
        MissingFile(PathBuf),
        #[error("{0:?} changed on disk while it was being edited")]
        Conflict(PathBuf),
        #[error("editor `{editor}` failed: {reason}")]
        Editor { editor: String, reason: String },
        #[error("I/O error on {path:?}")]
        Io {
            path: PathBuf,
            #[source]
            source: io::Error,
        },
    }

    impl WeeklyError {
        /// Adapter for `map_err` on filesystem calls.
        pub fn io(path: &Path) -> impl FnOnce(io::Error) -> Self {
            let path = path.to_path_buf();
            move |source| WeeklyError::Io { path, source }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn status_markers_are_bijective() {
            for status in [Status::Pending, Status::Done, Status::Canceled] {
                assert_eq!(Status::from_marker(status.marker()), Some(status));
            }
            assert_eq!(Status::from_marker('X'), None);
        }

        #[test]
        fn status_names_are_closed() {
            assert_eq!("done".parse::<Status>().unwrap(), Status::Done);
            assert_eq!(" Canceled ".parse::<Status>().unwrap(), Status::Canceled);
            let err = "finished".parse::<Status>().unwrap_err();
            assert!(matches!(err, WeeklyError::InvalidStatus(s) if s == "finished"));
        }

        #[test]
        fn status_display_matches_accepted_names() {
            for status in [Status::Pending, Status::Done, Status::Canceled] {
                assert_eq!(status.to_string().parse::<Status>().unwrap(), status);
            }
            assert_eq!(Status::Canceled.to_string(), "canceled");
        }

        #[test]
        fn section_names_map_case_insensitively() {
            assert_eq!(
                ThreePSection::from_name("PROBLEMS").unwrap(),
                ThreePSection::Problems
            );
            assert!(matches!(
                ThreePSection::from_name("progres"),
                Err(WeeklyError::InvalidSection(_))
            ));
        }

        #[test]
        fn time_range_rejects_empty_and_reversed() {
            let nine = NaiveTime::from_hms_opt(9, 0, 0).unwrap();
            let ten = NaiveTime::from_hms_opt(10, 0, 0).unwrap();
            assert!(TimeRange::new(nine, ten).is_ok());
            assert!(TimeRange::new(nine, nine).is_err());
            assert!(TimeRange::new(ten, nine).is_err());
            assert_eq!(TimeRange::new(nine, ten).unwrap().to_string(), "09:00 - 10:00");
        }

        #[test]
        fn truncation_drops_seconds() {
            let t = NaiveTime::from_hms_opt(14, 10, 42).unwrap();
            assert_eq!(
                truncate_to_minute(t),
                NaiveTime::from_hms_opt(14, 10, 0).unwrap()
            );
        }
    }
}

pub mod parser {
    //! Line-oriented parser for weekly notes.
    //!
    //! Parsing strategy:
    //! - Every line is classified on its own with small `nom` recognisers (`classify`).
    //!   Classification is purely syntactic and never fails.
    //! - A state machine (`Preamble`, `InDay`, `InThreeP`) turns each classified line into
    //!   an `Action` through a single transition table; only then does context decide what
    //!   a line means (a `### Progress` inside a time block is just a note).
    //! - Blank lines survive only in the preamble.

    use crate::core::*;
    use chrono::{Datelike, NaiveDate, NaiveTime};
    use nom::{
        IResult,
        branch::alt,
        bytes::complete::{tag, take_while_m_n},
        character::complete::{char, one_of, space0, space1},
        combinator::{map_opt, map_res, value},
        error::VerboseError,
        sequence::{preceded, separated_pair, tuple},
    };
    use tracing::warn;

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    /* ------------------------ Public entry points ------------------------ */

    /// Parse a weekly note. `anchor` decides the year of each `dd/mm` day header: the
    /// candidate closest to it wins.
    pub fn parse_week(input: &str, anchor: NaiveDate) -> Result<WeekDocument> {
        let mut parser = WeekParser::new(anchor);
        for (idx, raw) in input.lines().enumerate() {
            parser.feed(idx + 1, raw)?;
        }
        Ok(parser.doc)
    }

    /// A day header found in raw text.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct DayHeaderPosition {
        /// 1-based.
        pub line: usize,
        pub weekday: String,
    }

    pub fn day_header_positions(input: &str) -> Vec<DayHeaderPosition> {
        input
            .lines()
            .enumerate()
            .filter_map(|(idx, raw)| match classify(raw) {
                Line::DayHeader { weekday, .. } => Some(DayHeaderPosition {
                    line: idx + 1,
                    weekday: weekday.to_string(),
                }),
                _ => None,
            })
            .collect()
    }

    /* --------------------------- Classification --------------------------- */

    /// Syntactic shape of a single line, independent of parser state.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Line<'a> {
        DayHeader {
            weekday: &'a str,
            day: u32,
            month: u32,
        },
        ThreePHeader,
        Subsection(ThreePSection),
        /// Raw `(hour, minute)` pairs; validated when a block is opened.
        BlockHeader {
            start: (u32, u32),
            end: (u32, u32),
        },
        Task {
            status: Status,
            text: &'a str,
        },
        Blank,
        Text,
    }

    pub fn classify(raw: &str) -> Line<'_> {
        if raw.trim().is_empty() {
            return Line::Blank;
        }
        match alt((day_header, three_p_header, subsection, block_header, task_line))(raw) {
            Ok((_, line)) => line,
            Err(_) => Line::Text,
        }
    }

    fn day_header(i: &str) -> PResult<'_, Line<'_>> {
        let (i, _) = tuple((tag("##"), space1))(i)?;
        let (i, weekday) = alt((
            tag("Mon"),
            tag("Tue"),
            tag("Wed"),
            tag("Thu"),
            tag("Fri"),
            tag("Sat"),
            tag("Sun"),
        ))(i)?;
        let (i, _) = space1(i)?;
        let (i, (day, month)) = separated_pair(two_digits, char('/'), two_digits)(i)?;
        Ok((
            i,
            Line::DayHeader {
                weekday,
                day,
                month,
            },
        ))
    }

    fn three_p_header(i: &str) -> PResult<'_, Line<'_>> {
        value(Line::ThreePHeader, tuple((tag("##"), space1, tag("3Ps"))))(i)
    }

    fn subsection(i: &str) -> PResult<'_, Line<'_>> {
        preceded(
            tuple((tag("###"), space1)),
            alt((
                value(Line::Subsection(ThreePSection::Progress), tag("Progress")),
                value(Line::Subsection(ThreePSection::Planned), tag("Planned")),
                value(Line::Subsection(ThreePSection::Problems), tag("Problems")),
            )),
        )(i)
    }

    fn block_header(i: &str) -> PResult<'_, Line<'_>> {
        let (i, _) = tuple((tag("###"), space1))(i)?;
        let (i, start) = clock(i)?;
        let (i, _) = tuple((space1, char('-'), space1))(i)?;
        let (i, end) = clock(i)?;
        Ok((i, Line::BlockHeader { start, end }))
    }

    fn task_line(i: &str) -> PResult<'_, Line<'_>> {
        let (i, _) = tuple((space0, char('-'), space1, char('[')))(i)?;
        let (i, status) = map_opt(one_of(" x~"), Status::from_marker)(i)?;
        let (i, _) = char(']')(i)?;
        Ok((
            "",
            Line::Task {
                status,
                text: i.trim(),
            },
        ))
    }

    fn clock(i: &str) -> PResult<'_, (u32, u32)> {
        separated_pair(one_or_two_digits, char(':'), two_digits)(i)
    }

    fn one_or_two_digits(i: &str) -> PResult<'_, u32> {
        map_res(take_while_m_n(1, 2, |c: char| c.is_ascii_digit()), str::parse::<u32>)(i)
    }

    fn two_digits(i: &str) -> PResult<'_, u32> {
        map_res(take_while_m_n(2, 2, |c: char| c.is_ascii_digit()), str::parse::<u32>)(i)
    }

    /* ---------------------------- State machine ---------------------------- */

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum State {
        Preamble,
        InDay {
            date: NaiveDate,
            block: Option<usize>,
        },
        InThreeP(Option<ThreePSection>),
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Action<'a> {
        OpenDay(NaiveDate),
        EnterThreeP,
        SelectBucket(ThreePSection),
        OpenBlock(TimeRange),
        PushTask(Task),
        PushBlockNote(&'a str),
        PushBucket(&'a str),
        PushExtra(&'a str),
        Drop,
    }

    struct WeekParser {
        anchor: NaiveDate,
        state: State,
        /// Set by the first day or 3Ps header; the preamble is closed from then on.
        content_started: bool,
        doc: WeekDocument,
    }

    impl WeekParser {
        fn new(anchor: NaiveDate) -> Self {
            Self {
                anchor,
                state: State::Preamble,
                content_started: false,
                doc: WeekDocument::new(),
            }
        }

        fn feed(&mut self, line_no: usize, raw: &str) -> Result<()> {
            let action = self
                .transition(classify(raw), raw)
                .map_err(|reason| WeeklyError::InvalidDocument {
                    line: line_no,
                    reason,
                })?;
            self.apply(line_no, action);
            Ok(())
        }

        fn transition<'a>(
            &self,
            line: Line<'a>,
            raw: &'a str,
        ) -> std::result::Result<Action<'a>, String> {
            let action = match (self.state, line) {
                (_, Line::DayHeader { day, month, .. }) => {
                    let date = resolve_day(day, month, self.anchor)
                        .ok_or_else(|| format!("{day:02}/{month:02} is not a calendar date"))?;
                    Action::OpenDay(date)
                }
                (_, Line::ThreePHeader) => Action::EnterThreeP,
                (State::InThreeP(_), Line::Subsection(section)) => Action::SelectBucket(section),
                (State::InDay { .. }, Line::BlockHeader { start, end }) => {
                    Action::OpenBlock(block_range(start, end)?)
                }
                (State::InDay { block: Some(_), .. }, Line::Task { status, text }) => {
                    Action::PushTask(Task::new(text, status))
                }
                (State::InDay { block: Some(_), .. }, Line::Blank) => Action::Drop,
                (State::InDay { block: Some(_), .. }, _) => Action::PushBlockNote(raw),
                (State::InThreeP(Some(_)), Line::Blank) => Action::Drop,
                (State::InThreeP(Some(_)), _) => Action::PushBucket(raw),
                _ if !self.content_started => Action::PushExtra(raw),
                _ => Action::Drop,
            };
            Ok(action)
        }

        fn apply(&mut self, line_no: usize, action: Action<'_>) {
            match action {
                Action::OpenDay(date) => {
                    if self.doc.days.insert(date, DayRecord::default()).is_some() {
                        warn!(
                            line = line_no,
                            %date,
                            "duplicate day header replaces the earlier section"
                        );
                    }
                    self.state = State::InDay { date, block: None };
                    self.content_started = true;
                }
                Action::EnterThreeP => {
                    self.state = State::InThreeP(None);
                    self.content_started = true;
                }
                Action::SelectBucket(section) => self.state = State::InThreeP(Some(section)),
                Action::OpenBlock(range) => {
                    if let State::InDay { date, .. } = self.state {
                        let blocks = &mut self.doc.day_or_insert(date).blocks;
                        blocks.push(TimeBlock::new(range));
                        let idx = blocks.len() - 1;
                        self.state = State::InDay {
                            date,
                            block: Some(idx),
                        };
                    }
                }
                Action::PushTask(task) => {
                    if let Some(block) = self.current_block() {
                        block.tasks.push(task);
                    }
                }
                Action::PushBlockNote(raw) => {
                    if let Some(block) = self.current_block() {
                        block.notes.push(raw.to_string());
                    }
                }
                Action::PushBucket(raw) => {
                    if let State::InThreeP(Some(section)) = self.state {
                        self.doc.three_p.bucket_mut(section).push(raw.to_string());
                    }
                }
                Action::PushExtra(raw) => self.doc.extra_lines.push(raw.to_string()),
                Action::Drop => {}
            }
        }

        fn current_block(&mut self) -> Option<&mut TimeBlock> {
            match self.state {
                State::InDay {
                    date,
                    block: Some(idx),
                } => self.doc.days.get_mut(&date)?.blocks.get_mut(idx),
                _ => None,
            }
        }
    }

    /// Headers carry no year: pick the valid date nearest to `anchor`.
    fn resolve_day(day: u32, month: u32, anchor: NaiveDate) -> Option<NaiveDate> {
        (anchor.year() - 1..=anchor.year() + 1)
            .filter_map(|year| NaiveDate::from_ymd_opt(year, month, day))
            .min_by_key(|date| (*date - anchor).num_days().abs())
    }

    fn block_range(
        (sh, sm): (u32, u32),
        (eh, em): (u32, u32),
    ) -> std::result::Result<TimeRange, String> {
        let start = NaiveTime::from_hms_opt(sh, sm, 0)
            .ok_or_else(|| format!("{sh:02}:{sm:02} is not a time of day"))?;
        let end = NaiveTime::from_hms_opt(eh, em, 0)
            .ok_or_else(|| format!("{eh:02}:{em:02} is not a time of day"))?;
        TimeRange::new(start, end).map_err(|e| e.to_string())
    }

}

pub mod schedule {
    //! Placement of new entries into a day's time blocks.
    //!
    //! Blocks are addressed by index into the day's `Vec`; callers re-borrow after every
    //! insertion instead of holding references across it.

    use crate::core::*;
    use chrono::{Duration, NaiveTime};

    /// Length of a block created for a single instant.
    pub const DEFAULT_BLOCK_MINUTES: i64 = 30;

    /// How a caller addresses the block that should receive an entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Placement {
        /// A single instant: reuse the containing block or create a 30-minute one.
        At(NaiveTime),
        /// An explicit interval: merge on an equal start or insert a new block.
        Within(TimeRange),
    }

    /// First block with `start <= t <= end`.
    pub fn containing_block(blocks: &[TimeBlock], t: NaiveTime) -> Option<usize> {
        blocks.iter().position(|b| b.contains(t))
    }

    /// First block that does not start before `s`.
    pub fn first_starting_at_or_after(blocks: &[TimeBlock], s: NaiveTime) -> Option<usize> {
        blocks.iter().position(|b| b.start >= s)
    }

    /// Index of the block that receives the entry, creating or extending one as needed.
    pub fn locate_or_create(blocks: &mut Vec<TimeBlock>, placement: Placement) -> usize {
        match placement {
            Placement::At(t) => place_at(blocks, t),
            Placement::Within(range) => place_within(blocks, range),
        }
    }

    fn place_at(blocks: &mut Vec<TimeBlock>, t: NaiveTime) -> usize {
        if let Some(idx) = containing_block(blocks, t) {
            return idx;
        }

        let idx = blocks
            .iter()
            .position(|b| b.start > t)
            .unwrap_or(blocks.len());

        // The preceding block starts at or before `t` and does not contain it, so it
        // ends before `t` and the new block can be anchored at `t` itself.
        let mut range = default_range(t);
        if let Some(next) = blocks.get(idx) {
            // Clipping to an earlier-or-equal start would empty the block; that only
            // happens when the file already holds overlapping blocks.
            if next.start > range.start && next.start < range.end {
                range.end = next.start;
            }
        }

        blocks.insert(idx, TimeBlock::new(range));
        idx
    }

    fn place_within(blocks: &mut Vec<TimeBlock>, range: TimeRange) -> usize {
        let idx = first_starting_at_or_after(blocks, range.start).unwrap_or(blocks.len());

        if let Some(prev) = idx.checked_sub(1) {
            if blocks[prev].end > range.start {
                return prev;
            }
        }

        if blocks.get(idx).is_some_and(|b| b.start == range.start) {
            let limit = blocks.get(idx + 1).map(|next| next.start);
            let block = &mut blocks[idx];
            let mut end = block.end.max(range.end);
            if let Some(limit) = limit {
                end = end.min(limit).max(block.end);
            }
            block.end = end;
            return idx;
        }

        let end = blocks
            .get(idx)
            .map_or(range.end, |next| range.end.min(next.start));
        blocks.insert(
            idx,
            TimeBlock::new(TimeRange {
                start: range.start,
                end,
            }),
        );
        idx
    }

    /// A default-length block from `start`, kept inside the same day.
    fn default_range(start: NaiveTime) -> TimeRange {
        let last = last_minute();
        let start = start.min(last - Duration::minutes(1));
        let (end, wrapped) = start.overflowing_add_signed(Duration::minutes(DEFAULT_BLOCK_MINUTES));
        let end = if wrapped != 0 || end > last { last } else { end };
        TimeRange { start, end }
    }

    fn last_minute() -> NaiveTime {
        NaiveTime::from_hms_opt(23, 59, 0).expect("23:59 is a valid time")
    }

}

pub mod ops {
    //! Edits and queries over a parsed week. Every mutation goes through
    //! `schedule::locate_or_create`; queries never modify the document.

    use crate::core::*;
    use crate::parser::{Line, classify};
    use crate::schedule::{self, Placement};
    use chrono::{NaiveDate, NaiveTime};
    use tracing::debug;

    /// One edit, as resolved from the command line.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Mutation {
        AddTask {
            date: NaiveDate,
            placement: Placement,
            text: String,
        },
        AddBlockNote {
            date: NaiveDate,
            range: TimeRange,
            note: String,
        },
        AddThreePNote {
            section: ThreePSection,
            note: String,
        },
        /// `start` selects the first block that does not start before it.
        UpdateTaskByIndex {
            date: NaiveDate,
            start: NaiveTime,
            index: usize,
            status: Status,
        },
        /// `at` selects the block containing that instant.
        UpdateTaskByText {
            date: NaiveDate,
            at: NaiveTime,
            text: String,
            status: Status,
        },
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Outcome {
        Changed,
        Unchanged,
    }

    pub fn apply(doc: &mut WeekDocument, mutation: Mutation) -> Result<Outcome> {
        match mutation {
            Mutation::AddTask {
                date,
                placement,
                text,
            } => {
                add_task(doc, date, placement, &text)?;
            }
            Mutation::AddBlockNote { date, range, note } => {
                add_block_note(doc, date, range, &note)?;
            }
            Mutation::AddThreePNote { section, note } => add_three_p_note(doc, section, &note)?,
            Mutation::UpdateTaskByIndex {
                date,
                start,
                index,
                status,
            } => update_task_by_index(doc, date, start, index, status)?,
            Mutation::UpdateTaskByText {
                date,
                at,
                text,
                status,
            } => {
                if !update_task_by_text(doc, date, at, &text, status) {
                    debug!(%date, text = %text, "no matching task; nothing to update");
                    return Ok(Outcome::Unchanged);
                }
            }
        }
        Ok(Outcome::Changed)
    }

    /// Append a pending task; returns the receiving block's index.
    pub fn add_task(
        doc: &mut WeekDocument,
        date: NaiveDate,
        placement: Placement,
        text: &str,
    ) -> Result<usize> {
        single_line(text)?;
        let blocks = &mut doc.day_or_insert(date).blocks;
        let idx = schedule::locate_or_create(blocks, placement);
        blocks[idx].tasks.push(Task::pending(text));
        Ok(idx)
    }

    /// Append `- <note>` to the block addressed by `range`.
    pub fn add_block_note(
        doc: &mut WeekDocument,
        date: NaiveDate,
        range: TimeRange,
        note: &str,
    ) -> Result<usize> {
        single_line(note)?;
        let line = bullet(note);
        // Inside a block a `- [x] ...` line is a task, not a note.
        if matches!(classify(&line), Line::Task { .. }) {
            return Err(WeeklyError::InvalidText {
                text: note.to_string(),
                reason: "a block note would be read back as a task",
            });
        }
        let blocks = &mut doc.day_or_insert(date).blocks;
        let idx = schedule::locate_or_create(blocks, Placement::Within(range));
        blocks[idx].notes.push(line);
        Ok(idx)
    }

    pub fn add_three_p_note(
        doc: &mut WeekDocument,
        section: ThreePSection,
        note: &str,
    ) -> Result<()> {
        single_line(note)?;
        doc.three_p.bucket_mut(section).push(bullet(note));
        Ok(())
    }

    pub fn update_task_by_index(
        doc: &mut WeekDocument,
        date: NaiveDate,
        start: NaiveTime,
        index: usize,
        status: Status,
    ) -> Result<()> {
        let day = doc.day_mut(date).ok_or(WeeklyError::DayNotFound(date))?;
        let idx = schedule::first_starting_at_or_after(&day.blocks, start)
            .ok_or(WeeklyError::BlockNotFound { date, time: start })?;
        let tasks = &mut day.blocks[idx].tasks;
        let len = tasks.len();
        let task = tasks
            .get_mut(index)
            .ok_or(WeeklyError::IndexOutOfRange { index, len })?;
        task.status = status;
        Ok(())
    }

    /// Sets the status of the first task whose text equals `text` (trimmed) in the block
    /// containing `at`. Returns whether a task matched; a miss leaves `doc` untouched.
    pub fn update_task_by_text(
        doc: &mut WeekDocument,
        date: NaiveDate,
        at: NaiveTime,
        text: &str,
        status: Status,
    ) -> bool {
        let Some(day) = doc.day_mut(date) else {
            return false;
        };
        let Some(idx) = schedule::containing_block(&day.blocks, at) else {
            return false;
        };
        let wanted = text.trim();
        match day.blocks[idx].tasks.iter_mut().find(|t| t.text == wanted) {
            Some(task) => {
                task.status = status;
                true
            }
            None => false,
        }
    }

    /* ------------------------------- Queries ------------------------------- */

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum TaskScope {
        /// Tasks of the block containing the instant (none when no block does).
        At(NaiveTime),
        AllDay,
    }

    pub fn list_tasks(
        doc: &WeekDocument,
        date: NaiveDate,
        scope: TaskScope,
    ) -> Result<Vec<&Task>> {
        let day = doc.day(date).ok_or(WeeklyError::DayNotFound(date))?;
        let tasks = match scope {
            TaskScope::At(t) => schedule::containing_block(&day.blocks, t)
                .map(|idx| day.blocks[idx].tasks.iter().collect())
                .unwrap_or_default(),
            TaskScope::AllDay => day.blocks.iter().flat_map(|b| b.tasks.iter()).collect(),
        };
        Ok(tasks)
    }

    /// Block intervals for `date`; empty when the day has no section.
    pub fn time_blocks(doc: &WeekDocument, date: NaiveDate) -> Vec<TimeRange> {
        doc.day(date)
            .map(|day| day.blocks.iter().map(TimeBlock::range).collect())
            .unwrap_or_default()
    }

    fn bullet(note: &str) -> String {
        format!("- {note}")
    }

    /// Every entry occupies exactly one line of the file.
    fn single_line(text: &str) -> Result<()> {
        if text.contains(['\n', '\r']) {
            return Err(WeeklyError::InvalidText {
                text: text.to_string(),
                reason: "entries must fit on one line",
            });
        }
        Ok(())
    }

}

pub mod format {
    //! Canonical rendering of a `WeekDocument`; the inverse of `parser::parse_week` for
    //! documents built from the supported grammar.

    use super::core::*;

    pub fn format_week(doc: &WeekDocument) -> String {
        let mut out = String::new();

        for line in &doc.extra_lines {
            out.push_str(line);
            out.push('\n');
        }

        for (date, day) in &doc.days {
            out.push_str(&format!("## {}\n\n", date.format("%a %d/%m")));
            for block in &day.blocks {
                format_block(&mut out, block);
            }
        }

        out.push_str("## 3Ps\n\n");
        for section in ThreePSection::ALL {
            out.push_str(&format!("### {}\n\n", section.title()));
            for line in doc.three_p.bucket(section) {
                out.push_str(line);
                out.push('\n');
            }
            out.push('\n');
        }

        out
    }

    fn format_block(out: &mut String, block: &TimeBlock) {
        out.push_str(&format!("### {}\n", block.range()));

        for task in &block.tasks {
            out.push('\n');
            out.push_str(&format!("- [{}] {}\n", task.status.marker(), task.text));
        }

        if !block.notes.is_empty() {
            out.push('\n');
        }
        for note in &block.notes {
            out.push_str(note);
            out.push('\n');
        }
        out.push('\n');
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::parser::parse_week;
        use chrono::{NaiveDate, NaiveTime};

        fn hm(h: u32, m: u32) -> NaiveTime {
            NaiveTime::from_hms_opt(h, m, 0).unwrap()
        }

        fn sample() -> WeekDocument {
            let mut doc = WeekDocument::new();
            doc.extra_lines = vec!["# 2025 - Week 23".into(), "".into()];

            let wednesday = NaiveDate::from_ymd_opt(2025, 6, 4).unwrap();
            let monday = NaiveDate::from_ymd_opt(2025, 6, 2).unwrap();

            let mut block = TimeBlock::new(TimeRange::new(hm(9, 0), hm(9, 30)).unwrap());
            block.tasks.push(Task::pending("write report"));
            block.tasks.push(Task::new("ping ops", Status::Canceled));
            block.notes.push("- context".into());
            block.notes.push("  nested".into());
            doc.day_or_insert(wednesday).blocks.push(block);

            let mut notes_only = TimeBlock::new(TimeRange::new(hm(13, 0), hm(14, 0)).unwrap());
            notes_only.notes.push("lunch talk".into());
            doc.day_or_insert(wednesday).blocks.push(notes_only);

            doc.day_or_insert(monday);

            doc.three_p.progress.push("- parser".into());
            doc.three_p.problems.push("- none".into());
            doc
        }

        #[test]
        fn renders_fixed_layout() {
            let expected = "# 2025 - Week 23\n\
\n\
## Wed 04/06\n\
\n\
### 09:00 - 09:30\n\
\n\
- [ ] write report\n\
\n\
- [~] ping ops\n\
\n\
- context\n  nested\n\
\n\
### 13:00 - 14:00\n\
\n\
lunch talk\n\
\n\
## Mon 02/06\n\
\n\
## 3Ps\n\
\n\
### Progress\n\
\n\
- parser\n\
\n\
### Planned\n\
\n\
\n\
### Problems\n\
\n\
- none\n\
\n";
            assert_eq!(format_week(&sample()), expected);
        }

        #[test]
        fn parse_inverts_format() {
            let doc = sample();
            let anchor = NaiveDate::from_ymd_opt(2025, 6, 2).unwrap();
            let reparsed = parse_week(&format_week(&doc), anchor).expect("parse");
            assert_eq!(reparsed, doc);
        }

        #[test]
        fn empty_document_round_trips() {
            let doc = WeekDocument::new();
            let anchor = NaiveDate::from_ymd_opt(2025, 6, 2).unwrap();
            let text = format_week(&doc);
            assert_eq!(parse_week(&text, anchor).unwrap(), doc);
            assert_eq!(format_week(&parse_week(&text, anchor).unwrap()), text);
        }

        #[test]
        fn formatting_is_idempotent_on_loose_input() {
            let loose = "## Mon 02/06\n### 9:00 - 9:30\n- [x]   a   \n   note\n\n\n## 3Ps\n### Planned\nx\n";
            let anchor = NaiveDate::from_ymd_opt(2025, 6, 2).unwrap();
            let once = format_week(&parse_week(loose, anchor).unwrap());
            let twice = format_week(&parse_week(&once, anchor).unwrap());
            assert_eq!(once, twice);
            assert!(once.contains("### 09:00 - 09:30\n\n- [x] a\n\n   note\n\n"));
        }
    }
}

pub mod template {
    //! New-note bootstrap: template expansion and the external editor.
    //!
    //! Supported placeholder: `{{ format-date <expr> '<strftime>' }}` where `<expr>` is
    //! `now` or `(date "today" | "next <weekday>" | "last <weekday>")`. Anything else
    //! between braces is replaced by its inner text.

    use crate::core::{Result, WeeklyError};
    use chrono::{Datelike, Duration, NaiveDate, Weekday};
    use nom::{
        IResult,
        branch::alt,
        bytes::complete::{tag, take_until},
        character::complete::{char, space0, space1},
        combinator::{map, value},
        error::VerboseError,
        sequence::{delimited, tuple},
    };
    use std::{
        fmt::Write as _,
        fs,
        io::Write as _,
        path::Path,
        process::Command,
    };
    use tracing::{debug, warn};

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    /// Expand every `{{ ... }}` placeholder in `template`.
    pub fn render(template: &str, today: NaiveDate) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(open) = rest.find("{{") {
            let after = &rest[open + 2..];
            let Some(close) = after.find("}}") else {
                break;
            };
            let inner = &after[..close];
            if inner.contains('\n') {
                out.push_str(&rest[..open + 2]);
                rest = after;
                continue;
            }
            out.push_str(&rest[..open]);
            out.push_str(&expand(inner.trim(), today));
            rest = &after[close + 2..];
        }
        out.push_str(rest);
        out
    }

    fn expand(inner: &str, today: NaiveDate) -> String {
        format_date_placeholder(inner, today).unwrap_or_else(|| inner.to_string())
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum DateExpr<'a> {
        Now,
        Relative(&'a str),
    }

    fn format_date_placeholder(inner: &str, today: NaiveDate) -> Option<String> {
        let (format, expr) = placeholder(inner).ok()?;
        let date = match expr {
            DateExpr::Now => today,
            DateExpr::Relative(phrase) => resolve_relative(phrase, today)?,
        };
        let format = format.replace('\'', "");
        let dt = date.and_hms_opt(0, 0, 0)?;
        let mut out = String::new();
        // Unsupported specifiers surface as a formatting error rather than a panic.
        write!(out, "{}", dt.format(format.trim())).ok()?;
        Some(out)
    }

    fn placeholder(i: &str) -> PResult<'_, DateExpr<'_>> {
        let (i, _) = tuple((tag("format-date"), space1))(i)?;
        let (i, expr) = alt((
            value(DateExpr::Now, tag("now")),
            map(
                delimited(
                    tuple((char('('), space0, tag("date"), space1, char('"'))),
                    take_until("\""),
                    tuple((char('"'), space0, char(')'))),
                ),
                DateExpr::Relative,
            ),
        ))(i)?;
        let (i, _) = space0(i)?;
        Ok((i, expr))
    }

    /// `today`, `next <weekday>` (strictly after) or `last <weekday>` (strictly before).
    fn resolve_relative(phrase: &str, today: NaiveDate) -> Option<NaiveDate> {
        let mut words = phrase.split_whitespace();
        let (direction, day) = (words.next()?, words.next());
        if words.next().is_some() {
            return None;
        }
        let offset = match (direction, day) {
            ("today", None) => 0,
            ("next", Some(day)) => {
                let target: Weekday = day.parse().ok()?;
                let ahead = (7 + target.num_days_from_monday()
                    - today.weekday().num_days_from_monday())
                    % 7;
                if ahead == 0 { 7 } else { i64::from(ahead) }
            }
            ("last", Some(day)) => {
                let target: Weekday = day.parse().ok()?;
                let behind = (7 + today.weekday().num_days_from_monday()
                    - target.num_days_from_monday())
                    % 7;
                -(if behind == 0 { 7 } else { i64::from(behind) })
            }
            _ => return None,
        };
        today.checked_add_signed(Duration::days(offset))
    }

    /// Create `path` when it does not exist yet, from `template` if that file exists.
    /// Returns whether a file was created.
    pub fn ensure_note(path: &Path, template: Option<&Path>, today: NaiveDate) -> Result<bool> {
        if path.exists() {
            debug!(path = %path.display(), "note exists; no template applied");
            return Ok(false);
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(WeeklyError::io(parent))?;
        }

        let contents = match template {
            Some(template) if template.exists() => {
                debug!(template = %template.display(), "applying template to new note");
                let raw = fs::read_to_string(template).map_err(WeeklyError::io(template))?;
                render(&raw, today)
            }
            Some(template) => {
                warn!(
                    template = %template.display(),
                    "template does not exist; creating an empty note"
                );
                String::new()
            }
            None => String::new(),
        };

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(WeeklyError::io(path))?;
        file.write_all(contents.as_bytes())
            .map_err(WeeklyError::io(path))?;
        Ok(true)
    }

    /// Run `editor` on `path` through `sh`, so the command may carry its own flags.
    pub fn launch_editor(editor: &str, path: &Path) -> Result<()> {
        debug!(editor, path = %path.display(), "launching editor");
        let status = Command::new("sh")
            .arg("-c")
            .arg(format!("{editor} \"$1\""))
            .arg("sh")
            .arg(path)
            .status()
            .map_err(|e| WeeklyError::Editor {
                editor: editor.to_string(),
                reason: e.to_string(),
            })?;
        if status.success() {
            Ok(())
        } else {
            Err(WeeklyError::Editor {
                editor: editor.to_string(),
                reason: format!("exited with {status}"),
            })
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn wednesday() -> NaiveDate {
            NaiveDate::from_ymd_opt(2025, 6, 4).unwrap()
        }

        #[test]
        fn formats_now() {
            assert_eq!(
                render("# {{ format-date now '%Y - Week %V' }}\n", wednesday()),
                "# 2025 - Week 23\n"
            );
        }

        #[test]
        fn relative_dates() {
            let line = r#"## {{ format-date (date "next monday") '%a %d/%m' }}"#;
            assert_eq!(render(line, wednesday()), "## Mon 09/06");

            let line = r#"{{ format-date (date "last fri") '%d/%m' }}"#;
            assert_eq!(render(line, wednesday()), "30/05");

            let line = r#"{{ format-date (date "next wednesday") '%d/%m' }}"#;
            assert_eq!(render(line, wednesday()), "11/06");

            let line = r#"{{ format-date (date "today") '%d/%m' }}"#;
            assert_eq!(render(line, wednesday()), "04/06");
        }

        #[test]
        fn several_placeholders_on_one_line() {
            let line = r#"{{ format-date (date "last monday") '%d/%m' }} to {{ format-date (date "next friday") '%d/%m' }}"#;
            assert_eq!(render(line, wednesday()), "02/06 to 06/06");
        }

        #[test]
        fn unknown_placeholders_keep_their_text() {
            assert_eq!(render("Hi {{ name }}!", wednesday()), "Hi name!");
            assert_eq!(
                render(r#"{{ format-date (date "someday") '%d' }}"#, wednesday()),
                r#"format-date (date "someday") '%d'"#
            );
            assert_eq!(
                render("{{ format-date now '%Z' }}", wednesday()),
                "format-date now '%Z'"
            );
            assert_eq!(render("open {{ only", wednesday()), "open {{ only");
        }

        #[test]
        fn ensure_note_applies_template_once() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let template = tmp.path().join("weekly.md");
            fs::write(&template, "# {{ format-date now '%d/%m' }}\n").expect("write template");
            let note = tmp.path().join("notes").join("week.md");

            assert!(ensure_note(&note, Some(&template), wednesday()).expect("create"));
            assert_eq!(fs::read_to_string(&note).unwrap(), "# 04/06\n");

            fs::write(&note, "edited\n").unwrap();
            assert!(!ensure_note(&note, Some(&template), wednesday()).expect("exists"));
            assert_eq!(fs::read_to_string(&note).unwrap(), "edited\n");
        }

        #[test]
        fn ensure_note_without_template_creates_empty_file() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let note = tmp.path().join("scratch.md");
            let missing = tmp.path().join("nope.md");
            assert!(ensure_note(&note, Some(&missing), wednesday()).unwrap());
            assert_eq!(fs::read_to_string(&note).unwrap(), "");
        }

        #[test]
        fn editor_exit_status_is_reported() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let note = tmp.path().join("n.md");
            assert!(launch_editor("true", &note).is_ok());
            assert!(matches!(
                launch_editor("false", &note),
                Err(WeeklyError::Editor { .. })
            ));
        }
    }
}

pub mod storage {
    //! Weekly file location, load and commit.
    //!
    //! A commit renders the whole document first, then either prints it (debug) or
    //! swaps it in with a temp-file rename after checking the file was not edited
    //! since it was loaded.

    use crate::core::*;
    use crate::format::format_week;
    use crate::parser::parse_week;
    use chrono::{Datelike, NaiveDate};
    use std::{
        fs,
        io::{self, Write},
        path::{Path, PathBuf},
    };
    use tempfile::NamedTempFile;
    use tracing::{debug, info};

    pub const DEFAULT_EDITOR: &str = "nvim";

    /// Resolved configuration for one invocation.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Settings {
        pub notes_dir: PathBuf,
        pub templates_dir: PathBuf,
        pub editor: String,
    }

    impl Settings {
        /// Templates default to `<notes_dir>/templates`.
        pub fn new(notes_dir: impl Into<PathBuf>) -> Self {
            let notes_dir = notes_dir.into();
            Self {
                templates_dir: notes_dir.join("templates"),
                notes_dir,
                editor: DEFAULT_EDITOR.to_string(),
            }
        }

        pub fn weekly_path(&self, date: NaiveDate) -> PathBuf {
            self.notes_dir.join(weekly_file_name(date))
        }

        pub fn note_path(&self, name: &str) -> PathBuf {
            self.notes_dir.join(format!("{name}.md"))
        }

        pub fn template_path(&self, name: &str) -> PathBuf {
            self.templates_dir.join(format!("{name}.md"))
        }
    }

    /// `<ISO year> - Week <ISO week>.md`.
    pub fn weekly_file_name(date: NaiveDate) -> String {
        let week = date.iso_week();
        format!("{} - Week {:02}.md", week.year(), week.week())
    }

    /// A weekly note read from disk, remembering the text it was loaded from.
    #[derive(Debug, Clone)]
    pub struct WeeklyFile {
        path: PathBuf,
        anchor: NaiveDate,
        original: String,
    }

    impl WeeklyFile {
        /// Fails with `MissingFile` when `path` does not exist.
        pub fn open(path: impl Into<PathBuf>, anchor: NaiveDate) -> Result<Self> {
            let path = path.into();
            let original = match fs::read_to_string(&path) {
                Ok(text) => text,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    return Err(WeeklyError::MissingFile(path));
                }
                Err(e) => return Err(WeeklyError::Io { path, source: e }),
            };
            debug!(path = %path.display(), bytes = original.len(), "weekly note loaded");
            Ok(Self {
                path,
                anchor,
                original,
            })
        }

        pub fn path(&self) -> &Path {
            &self.path
        }

        pub fn text(&self) -> &str {
            &self.original
        }

        pub fn parse(&self) -> Result<WeekDocument> {
            parse_week(&self.original, self.anchor)
        }

        /// Print (`debug`) or persist the rendered document.
        pub fn commit(&self, doc: &WeekDocument, debug: bool, out: &mut dyn Write) -> Result<()> {
            let buffer = format_week(doc);
            if debug {
                out.write_all(buffer.as_bytes())
                    .map_err(WeeklyError::io(Path::new("<stdout>")))?;
                return Ok(());
            }

            let current = match fs::read_to_string(&self.path) {
                Ok(text) => text,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    return Err(WeeklyError::Conflict(self.path.clone()));
                }
                Err(e) => return Err(WeeklyError::io(&self.path)(e)),
            };
            if current != self.original {
                return Err(WeeklyError::Conflict(self.path.clone()));
            }

            write_atomically(&self.path, &buffer)?;
            info!(path = %self.path.display(), bytes = buffer.len(), "weekly note saved");
            Ok(())
        }
    }

    /// Replace `path` with `contents` via a sibling temp file and a rename.
    pub fn write_atomically(path: &Path, contents: &str) -> Result<()> {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut tmp = NamedTempFile::new_in(dir).map_err(WeeklyError::io(dir))?;
        tmp.write_all(contents.as_bytes())
            .map_err(WeeklyError::io(tmp.path()))?;
        if let Ok(meta) = fs::metadata(path) {
            tmp.as_file()
                .set_permissions(meta.permissions())
                .map_err(WeeklyError::io(tmp.path()))?;
        }
        tmp.as_file()
            .sync_all()
            .map_err(WeeklyError::io(tmp.path()))?;
        tmp.persist(path).map_err(|e| WeeklyError::Io {
            path: path.to_path_buf(),
            source: e.error,
        })?;
        Ok(())
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::ops::add_three_p_note;

        fn monday() -> NaiveDate {
            NaiveDate::from_ymd_opt(2025, 6, 2).unwrap()
        }

        #[test]
        fn weekly_file_names_use_iso_weeks() {
            assert_eq!(weekly_file_name(monday()), "2025 - Week 23.md");
            assert_eq!(
                weekly_file_name(NaiveDate::from_ymd_opt(2024, 12, 30).unwrap()),
                "2025 - Week 01.md"
            );
            assert_eq!(
                weekly_file_name(NaiveDate::from_ymd_opt(2027, 1, 1).unwrap()),
                "2026 - Week 53.md"
            );
        }

        #[test]
        fn settings_paths() {
            let settings = Settings::new("/n");
            assert_eq!(
                settings.weekly_path(monday()),
                PathBuf::from("/n/2025 - Week 23.md")
            );
            assert_eq!(settings.note_path("todo"), PathBuf::from("/n/todo.md"));
            assert_eq!(
                settings.template_path("weekly"),
                PathBuf::from("/n/templates/weekly.md")
            );
        }

        #[test]
        fn missing_file_fails_fast() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let err = WeeklyFile::open(tmp.path().join("absent.md"), monday()).unwrap_err();
            assert!(matches!(err, WeeklyError::MissingFile(_)));
        }

        #[test]
        fn commit_rewrites_the_whole_file() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let path = tmp.path().join("week.md");
            fs::write(&path, "header\n## Mon 02/06\n").unwrap();

            let file = WeeklyFile::open(&path, monday()).unwrap();
            let mut doc = file.parse().unwrap();
            add_three_p_note(&mut doc, ThreePSection::Progress, "done").unwrap();
            let mut out = Vec::new();
            file.commit(&doc, false, &mut out).unwrap();

            assert!(out.is_empty());
            assert_eq!(fs::read_to_string(&path).unwrap(), format_week(&doc));
        }

        #[test]
        fn debug_commit_prints_and_leaves_the_file_alone() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let path = tmp.path().join("week.md");
            fs::write(&path, "## Mon 02/06\n").unwrap();

            let file = WeeklyFile::open(&path, monday()).unwrap();
            let doc = file.parse().unwrap();
            let mut out = Vec::new();
            file.commit(&doc, true, &mut out).unwrap();

            assert_eq!(String::from_utf8(out).unwrap(), format_week(&doc));
            assert_eq!(fs::read_to_string(&path).unwrap(), "## Mon 02/06\n");
        }

        #[test]
        fn concurrent_edit_is_detected() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let path = tmp.path().join("week.md");
            fs::write(&path, "## Mon 02/06\n").unwrap();

            let file = WeeklyFile::open(&path, monday()).unwrap();
            let doc = file.parse().unwrap();
            fs::write(&path, "## Mon 02/06\nsomeone else\n").unwrap();

            let err = file.commit(&doc, false, &mut Vec::new()).unwrap_err();
            assert!(matches!(err, WeeklyError::Conflict(_)));
            assert_eq!(
                fs::read_to_string(&path).unwrap(),
                "## Mon 02/06\nsomeone else\n"
            );
        }
    }
}

pub use format::format_week;
pub use parser::{day_header_positions, parse_week};
