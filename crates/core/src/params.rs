//! Binding of partition parameter templates against a concrete run date.
//!
//! View definitions may declare parameter values such as `${run_date}` or
//! `${run_date-1d}` ("previous day"). The binder resolves every `${...}`
//! placeholder in a string; text outside placeholders is kept verbatim.
//!
//! Supported placeholders, each accepting an optional `+Nd` / `-Nd` offset:
//! - `run_date`  → `YYYY-MM-DD`
//! - `run_month` → `YYYY-MM`
//! - `run_year`  → `YYYY`
//! - `run_day`   → `DD`

use chrono::{Duration, NaiveDate};

use crate::error::VistaError;
use crate::view::{Parameter, ViewId};

#[derive(Debug, Clone, Copy)]
pub struct ParameterBinder {
    run_date: NaiveDate,
}

impl ParameterBinder {
    pub fn new(run_date: NaiveDate) -> Self {
        Self { run_date }
    }

    pub fn run_date(&self) -> NaiveDate {
        self.run_date
    }

    /// Resolve all placeholders in `template`.
    pub fn resolve(&self, template: &str) -> Result<String, VistaError> {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after.find('}').ok_or_else(|| {
                VistaError::Parameter(format!("unterminated placeholder in '{template}'"))
            })?;
            out.push_str(&self.evaluate(after[..end].trim())?);
            rest = &after[end + 1..];
        }
        out.push_str(rest);
        Ok(out)
    }

    /// Bind every parameter of a view id whose value is a template.
    pub fn bind_id(&self, id: &ViewId) -> Result<ViewId, VistaError> {
        let parameters = id
            .parameters
            .iter()
            .map(|p| {
                Ok(Parameter {
                    name: p.name.clone(),
                    value: match &p.value {
                        Some(v) => Some(self.resolve(v)?),
                        None => None,
                    },
                })
            })
            .collect::<Result<Vec<_>, VistaError>>()?;
        Ok(ViewId {
            namespace: id.namespace.clone(),
            name: id.name.clone(),
            parameters,
        })
    }

    fn evaluate(&self, expr: &str) -> Result<String, VistaError> {
        let (base, offset_days) = split_offset(expr)?;
        let date = Duration::try_days(offset_days)
            .and_then(|offset| self.run_date.checked_add_signed(offset))
            .ok_or_else(|| VistaError::Parameter(format!("date out of range: '{expr}'")))?;

        let format = match base {
            "run_date" => "%Y-%m-%d",
            "run_month" => "%Y-%m",
            "run_year" => "%Y",
            "run_day" => "%d",
            other => {
                return Err(VistaError::Parameter(format!(
                    "unknown placeholder '{other}'"
                )))
            }
        };
        Ok(date.format(format).to_string())
    }
}

/// Split `run_date-3d` into (`run_date`, -3).
fn split_offset(expr: &str) -> Result<(&str, i64), VistaError> {
    let Some(pos) = expr.find(['+', '-']) else {
        return Ok((expr, 0));
    };
    let (base, offset) = expr.split_at(pos);
    let sign = if offset.starts_with('-') { -1 } else { 1 };
    let days = offset[1..]
        .strip_suffix('d')
        .and_then(|n| n.trim().parse::<i64>().ok())
        .ok_or_else(|| VistaError::Parameter(format!("invalid offset in '{expr}'")))?;
    Ok((base.trim(), sign * days))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binder() -> ParameterBinder {
        ParameterBinder::new(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap())
    }

    #[test]
    fn resolves_run_date() {
        assert_eq!(binder().resolve("${run_date}").unwrap(), "2024-03-01");
    }

    #[test]
    fn previous_day_crosses_month_boundary() {
        assert_eq!(binder().resolve("${run_date-1d}").unwrap(), "2024-02-29");
        assert_eq!(binder().resolve("${run_month-1d}").unwrap(), "2024-02");
    }

    #[test]
    fn placeholders_embedded_in_paths() {
        let resolved = binder()
            .resolve("shop/orders/${run_year}/${run_day+2d}")
            .unwrap();
        assert_eq!(resolved, "shop/orders/2024/03");
    }

    #[test]
    fn literals_pass_through() {
        assert_eq!(binder().resolve("EU").unwrap(), "EU");
    }

    #[test]
    fn unknown_placeholder_is_error() {
        let err = binder().resolve("${yesterday}").unwrap_err();
        assert!(err.to_string().contains("yesterday"));
    }

    #[test]
    fn huge_offset_is_out_of_range() {
        let err = binder().resolve("${run_date-999999999999999d}").unwrap_err();
        assert!(err.to_string().contains("date out of range"));
        assert!(binder().resolve("${run_date+400000000d}").is_err());
    }

    #[test]
    fn unterminated_placeholder_is_error() {
        assert!(binder().resolve("${run_date").is_err());
    }

    #[test]
    fn bind_id_keeps_unbound_parameters() {
        let mut id = ViewId::new("shop", "orders").with_parameter("day", "${run_date}");
        id.parameters.push(Parameter::unbound("region"));
        let bound = binder().bind_id(&id).unwrap();
        assert_eq!(bound.parameters[0].value.as_deref(), Some("2024-03-01"));
        assert_eq!(bound.parameters[1].value, None);
    }
}
