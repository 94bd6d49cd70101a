use rusqlite::Connection;
use serde::Serialize;
use std::collections::BTreeMap;

/// All averages are reported on the 0-20 scale regardless of each
/// assessment's own ceiling.
pub const SCALE_MAX: f64 = 20.0;

/// Display rounding: two decimals, applied to the final quotient only.
/// Intermediate normalized scores stay unrounded.
pub fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

#[derive(Debug, Clone, Serialize)]
pub struct CalcError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl CalcError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }
}

/// One subject's scored assessment for one student in one reporting period.
/// `comment` is carried through untouched and never affects computation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeRecord {
    pub subject_id: String,
    pub subject_name: String,
    pub subject_code: String,
    pub score: f64,
    pub max_score: f64,
    pub coefficient: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// `weighted_average` is `None` when no usable records exist. A student with
/// no grades and a student who earned 0 must stay distinguishable.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateResult {
    pub weighted_average: Option<f64>,
    pub letter_grade: Option<&'static str>,
    pub subject_count: usize,
}

impl AggregateResult {
    pub fn empty() -> Self {
        Self {
            weighted_average: None,
            letter_grade: None,
            subject_count: 0,
        }
    }
}

/// Coefficient-weighted average over a pre-filtered record set.
///
/// Records with `max_score <= 0` or `coefficient <= 0` are excluded rather
/// than aborting the whole aggregation: one malformed row must not prevent
/// reporting the rest of a student's grades.
pub fn compute_weighted_average(records: &[GradeRecord]) -> AggregateResult {
    let mut weighted_sum = 0.0_f64;
    let mut total_weight = 0.0_f64;
    let mut included = 0_usize;

    for r in records {
        if r.max_score <= 0.0 || r.coefficient <= 0.0 {
            continue;
        }
        let normalized = r.score / r.max_score * SCALE_MAX;
        weighted_sum += normalized * r.coefficient;
        total_weight += r.coefficient;
        included += 1;
    }

    // Inclusion requires a positive coefficient, so zero total weight means
    // zero included records.
    if total_weight <= 0.0 {
        return AggregateResult::empty();
    }

    let avg = round2(weighted_sum / total_weight);
    AggregateResult {
        weighted_average: Some(avg),
        letter_grade: Some(classify(avg)),
        subject_count: included,
    }
}

/// Fixed performance bands on the 0-20 scale. Lower bounds are inclusive:
/// exactly 16.0 is an "A", 15.99 a "B".
pub fn classify(weighted_average: f64) -> &'static str {
    if weighted_average >= 16.0 {
        "A"
    } else if weighted_average >= 14.0 {
        "B"
    } else if weighted_average >= 12.0 {
        "C"
    } else if weighted_average >= 10.0 {
        "D"
    } else {
        "F"
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentIdentity {
    pub id: String,
    pub first_name: String,
    pub last_name: String,
    pub matricule: String,
    pub date_of_birth: Option<String>,
    pub place_of_birth: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassInfo {
    pub id: String,
    pub name: String,
    pub level: String,
    pub academic_year: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ReportingPeriod {
    pub term: i64,
    pub sequence: i64,
}

/// Document-shaped structure ready for rendering: identity, period,
/// per-subject rows, aggregate. Zero grade rows is a valid, displayable
/// state, not an error.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportDocument {
    pub student: StudentIdentity,
    pub class: ClassInfo,
    pub term: i64,
    pub sequence: i64,
    pub grades: Vec<GradeRecord>,
    pub aggregate: AggregateResult,
}

pub fn build_report_card(
    student: StudentIdentity,
    class: ClassInfo,
    period: ReportingPeriod,
    records: Vec<GradeRecord>,
) -> ReportDocument {
    let aggregate = compute_weighted_average(&records);
    ReportDocument {
        student,
        class,
        term: period.term,
        sequence: period.sequence,
        grades: records,
        aggregate,
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeriodGrades {
    pub term: i64,
    pub sequence: i64,
    pub grades: Vec<GradeRecord>,
    pub aggregate: AggregateResult,
}

/// Cumulative grade history for one academic year. Periods keep their own
/// rows and averages; they are never collapsed into one number, so the
/// rendering layer can print a chronological breakdown.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptDocument {
    pub student: StudentIdentity,
    pub class: ClassInfo,
    pub academic_year: String,
    pub periods: Vec<PeriodGrades>,
}

pub fn build_transcript(
    student: StudentIdentity,
    class: ClassInfo,
    academic_year: String,
    records: Vec<(ReportingPeriod, GradeRecord)>,
) -> TranscriptDocument {
    let mut by_period: BTreeMap<ReportingPeriod, Vec<GradeRecord>> = BTreeMap::new();
    for (period, record) in records {
        by_period.entry(period).or_default().push(record);
    }

    let periods = by_period
        .into_iter()
        .map(|(period, grades)| {
            let aggregate = compute_weighted_average(&grades);
            PeriodGrades {
                term: period.term,
                sequence: period.sequence,
                grades,
                aggregate,
            }
        })
        .collect();

    TranscriptDocument {
        student,
        class,
        academic_year,
        periods,
    }
}

fn grade_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<GradeRecord> {
    Ok(GradeRecord {
        subject_id: r.get(0)?,
        subject_name: r.get(1)?,
        subject_code: r.get(2)?,
        score: r.get(3)?,
        max_score: r.get::<_, Option<f64>>(4)?.unwrap_or(SCALE_MAX),
        coefficient: r.get::<_, Option<f64>>(5)?.unwrap_or(1.0),
        comment: r.get(6)?,
    })
}

/// Grade rows for one student in one (term, sequence), joined with the
/// subject's name, code and coefficient.
pub fn load_period_records(
    conn: &Connection,
    student_id: &str,
    period: ReportingPeriod,
) -> Result<Vec<GradeRecord>, CalcError> {
    let mut stmt = conn
        .prepare(
            "SELECT g.subject_id, sub.name, sub.code, g.score, g.max_score, sub.coefficient, g.comment
             FROM grades g
             JOIN subjects sub ON sub.id = g.subject_id
             WHERE g.student_id = ? AND g.term = ? AND g.sequence = ?
             ORDER BY sub.name",
        )
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
    stmt.query_map((student_id, period.term, period.sequence), grade_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))
}

/// Every grade row for one student across all periods, chronologically.
pub fn load_all_records(
    conn: &Connection,
    student_id: &str,
) -> Result<Vec<(ReportingPeriod, GradeRecord)>, CalcError> {
    let mut stmt = conn
        .prepare(
            "SELECT g.subject_id, sub.name, sub.code, g.score, g.max_score, sub.coefficient, g.comment,
                    g.term, g.sequence
             FROM grades g
             JOIN subjects sub ON sub.id = g.subject_id
             WHERE g.student_id = ?
             ORDER BY g.term, g.sequence, sub.name",
        )
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
    stmt.query_map([student_id], |r| {
        let record = grade_row(r)?;
        let period = ReportingPeriod {
            term: r.get(7)?,
            sequence: r.get(8)?,
        };
        Ok((period, record))
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(|e| CalcError::new("db_query_failed", e.to_string()))
}
