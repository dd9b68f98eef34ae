//! time.window：根据任务上下文解析报告时间窗口
//!
//! 优先级：调用方给定的窗口 > 参数 range > task_context.data_range > 目标文本中的时间词 > 由 cron 推断。
//! 时区支持 IANA 名（chrono-tz，按夏令时规则换算）与 "+08:00" / "UTC+8" 形式的固定偏移。

use std::sync::OnceLock;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDate, Utc};
use chrono_tz::Tz;
use regex::Regex;
use serde_json::{json, Value};

use crate::core::{AgentInput, TimeWindow, ToolError};
use crate::memory::{ContextUpdate, StepContext, StepKind};
use crate::tools::{Tool, ToolOutput};

static RECENT_DAYS_RE: OnceLock<Option<Regex>> = OnceLock::new();

/// 报告时区：IANA 名（含夏令时规则）或固定偏移
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReportZone {
    Named(Tz),
    Fixed(FixedOffset),
}

impl ReportZone {
    /// 某一时刻在该时区的日期
    pub fn date_of(&self, instant: DateTime<Utc>) -> NaiveDate {
        match self {
            ReportZone::Named(tz) => instant.with_timezone(tz).date_naive(),
            ReportZone::Fixed(offset) => instant.with_timezone(offset).date_naive(),
        }
    }
}

/// 解析时区；无法识别时返回 None
pub fn parse_timezone(tz: &str) -> Option<ReportZone> {
    let trimmed = tz.trim();
    if let Ok(named) = trimmed.parse::<Tz>() {
        return Some(ReportZone::Named(named));
    }
    let lower = trimmed.to_lowercase();
    let offset = lower
        .strip_prefix("utc")
        .or_else(|| lower.strip_prefix("gmt"))
        .unwrap_or(&lower);
    if offset.is_empty() {
        return FixedOffset::east_opt(0).map(ReportZone::Fixed);
    }
    let (sign, rest) = match offset.chars().next()? {
        '+' => (1, &offset[1..]),
        '-' => (-1, &offset[1..]),
        _ => return None,
    };
    let (hours, minutes) = match rest.split_once(':') {
        Some((h, m)) => (h.parse::<i32>().ok()?, m.parse::<i32>().ok()?),
        None => (rest.parse::<i32>().ok()?, 0),
    };
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).map(ReportZone::Fixed)
}

/// 当前时区下的今天
pub fn today_in(tz: &str) -> NaiveDate {
    let now = Utc::now();
    match parse_timezone(tz) {
        Some(zone) => zone.date_of(now),
        None => {
            tracing::warn!(timezone = %tz, "unknown timezone, falling back to UTC");
            now.date_naive()
        }
    }
}

fn month_bounds(year: i32, month: u32) -> Option<(NaiveDate, NaiveDate)> {
    let start = NaiveDate::from_ymd_opt(year, month, 1)?;
    let next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)?
    };
    Some((start, next - Duration::days(1)))
}

fn week_start(day: NaiveDate) -> NaiveDate {
    day - Duration::days(day.weekday().num_days_from_monday() as i64)
}

/// 将时间词解析为窗口；无法识别返回 None
pub fn resolve_range(range: &str, today: NaiveDate) -> Option<TimeWindow> {
    let r = range.trim().to_lowercase();
    let has = |keys: &[&str]| keys.iter().any(|k| r.contains(k));

    // 先匹配"上/昨"，避免被"本/今"类词覆盖
    if has(&["昨日", "昨天", "yesterday"]) {
        let d = today - Duration::days(1);
        return Some(TimeWindow::new(d, d, "昨日"));
    }
    if has(&["上周", "last_week", "last week"]) {
        let start = week_start(today) - Duration::days(7);
        return Some(TimeWindow::new(start, start + Duration::days(6), "上周"));
    }
    if has(&["上月", "上个月", "last_month", "last month"]) {
        let first = NaiveDate::from_ymd_opt(today.year(), today.month(), 1)?;
        let prev = first - Duration::days(1);
        let (start, end) = month_bounds(prev.year(), prev.month())?;
        return Some(TimeWindow::new(start, end, "上月"));
    }
    if has(&["去年", "last_year", "last year"]) {
        let y = today.year() - 1;
        return Some(TimeWindow::new(
            NaiveDate::from_ymd_opt(y, 1, 1)?,
            NaiveDate::from_ymd_opt(y, 12, 31)?,
            "去年",
        ));
    }
    if let Some(days) = recent_days(&r) {
        let start = today - Duration::days(days as i64 - 1);
        return Some(TimeWindow::new(start, today, format!("近{days}天")));
    }
    if has(&["今日", "今天", "当日", "today"]) || r == "day" {
        return Some(TimeWindow::new(today, today, "今日"));
    }
    if has(&["本周", "这周", "this_week", "this week"]) || r == "week" {
        let start = week_start(today);
        return Some(TimeWindow::new(start, start + Duration::days(6), "本周"));
    }
    if has(&["本月", "当月", "这个月", "this_month", "this month"]) || r == "month" {
        let (start, end) = month_bounds(today.year(), today.month())?;
        return Some(TimeWindow::new(start, end, "本月"));
    }
    if has(&["本季度", "这个季度", "quarter"]) {
        let first_month = (today.month0() / 3) * 3 + 1;
        let start = NaiveDate::from_ymd_opt(today.year(), first_month, 1)?;
        let (_, end) = month_bounds(today.year(), first_month + 2)?;
        return Some(TimeWindow::new(start, end, "本季度"));
    }
    if has(&["今年", "本年", "this_year", "this year"]) || r == "year" {
        return Some(TimeWindow::new(
            NaiveDate::from_ymd_opt(today.year(), 1, 1)?,
            NaiveDate::from_ymd_opt(today.year(), 12, 31)?,
            "今年",
        ));
    }
    None
}

/// "近7天" / "最近30天" / "last 7 days"
fn recent_days(r: &str) -> Option<u32> {
    let re = RECENT_DAYS_RE
        .get_or_init(|| Regex::new(r"(?:近|最近|last\s*)(\d{1,3})\s*(?:天|日|days?)").ok())
        .as_ref()?;
    let caps = re.captures(r)?;
    caps.get(1)?.as_str().parse().ok().filter(|d| *d > 0)
}

/// 由 cron 推断报告周期：按月执行 → 上月，按周执行 → 上周，其余按日 → 昨日
pub fn window_from_cron(cron: &str, today: NaiveDate) -> Option<TimeWindow> {
    let fields: Vec<&str> = cron.split_whitespace().collect();
    if fields.len() < 5 {
        return None;
    }
    let (dom, dow) = (fields[2], fields[4]);
    let range = if dom != "*" && dom != "?" {
        "上月"
    } else if dow != "*" && dow != "?" {
        "上周"
    } else {
        "昨日"
    };
    resolve_range(range, today)
}

pub struct TimeWindowTool;

#[async_trait]
impl Tool for TimeWindowTool {
    fn name(&self) -> &str {
        "time.window"
    }

    fn description(&self) -> &str {
        "根据任务上下文（时区、cron、数据范围）计算报告时间窗口。参数: {\"range\": \"本月|上月|昨日|近7天...\"}，可省略。"
    }

    fn step_kind(&self) -> StepKind {
        StepKind::TimeWindow
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {"range": {"type": "string"}},
            "required": []
        })
    }

    async fn execute(
        &self,
        args: &Value,
        input: &AgentInput,
        _resources: &StepContext,
    ) -> Result<ToolOutput, ToolError> {
        let ctx = &input.task_context;
        let today = today_in(&ctx.timezone);

        let (window, basis) = if let Some(w) = &ctx.time_window {
            (Some(w.clone()), "task_context")
        } else if let Some(w) = args
            .get("range")
            .and_then(Value::as_str)
            .and_then(|r| resolve_range(r, today))
        {
            (Some(w), "args")
        } else if let Some(w) = ctx.data_range.as_deref().and_then(|r| resolve_range(r, today)) {
            (Some(w), "data_range")
        } else if let Some(w) = resolve_range(input.goal(), today) {
            (Some(w), "goal")
        } else {
            (window_from_cron(&ctx.cron_expression, today), "cron")
        };

        let window = window.ok_or_else(|| {
            ToolError::invalid_input(format!("无法从 cron \"{}\" 推断时间窗口", ctx.cron_expression))
        })?;
        if window.start > window.end {
            return Err(ToolError::invalid_input(format!("时间窗口起止颠倒: {window}")));
        }

        Ok(ToolOutput::ok()
            .with_observation(format!("时间窗口: {window}（依据 {basis}）"))
            .with_update(ContextUpdate::TimeWindow { window }))
    }
}
