use crate::research::model::Kpis;
use serde_json::{Number, Value};

const MEAN_FIELDS: [&str; 6] = ["netReturn", "cagr", "sharpe", "sortino", "winRate", "avgTrade"];
const MIN_FIELDS: [&str; 1] = ["maxDD"];
const SUM_FIELDS: [&str; 1] = ["trades"];

/// Reduces child KPI maps into one parent map.
///
/// Means for return/ratio fields, the worst (minimum) drawdown and the integer
/// sum of trades. Empty maps do not participate, non-numeric or absent values
/// are skipped per field, and a field nobody reported is left out.
pub fn aggregate_kpis<'a, I>(rows: I) -> Kpis
where
    I: IntoIterator<Item = &'a Kpis>,
{
    let rows: Vec<&Kpis> = rows.into_iter().filter(|r| !r.is_empty()).collect();
    let mut out = Kpis::new();

    for field in MEAN_FIELDS {
        let values = numeric_values(&rows, field);
        if !values.is_empty() {
            let mean = values.iter().sum::<f64>() / values.len() as f64;
            insert_f64(&mut out, field, mean);
        }
    }

    for field in MIN_FIELDS {
        if let Some(min) = numeric_values(&rows, field).into_iter().reduce(f64::min) {
            insert_f64(&mut out, field, min);
        }
    }

    for field in SUM_FIELDS {
        let values = numeric_values(&rows, field);
        if !values.is_empty() {
            let total: i64 = values.iter().map(|v| v.trunc() as i64).sum();
            out.insert(field.to_string(), Value::from(total));
        }
    }

    out
}

fn numeric_values(rows: &[&Kpis], field: &str) -> Vec<f64> {
    rows.iter()
        .filter_map(|r| r.get(field))
        .filter_map(Value::as_f64)
        .filter(|v| v.is_finite())
        .collect()
}

fn insert_f64(out: &mut Kpis, field: &str, value: f64) {
    if let Some(n) = Number::from_f64(value) {
        out.insert(field.to_string(), Value::Number(n));
    }
}
