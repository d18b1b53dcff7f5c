use crate::error::{LumenError, Result};
use crate::expr_parser::CalcExpr;
use crate::models::{Aggregation, Measure, MeasureKind, MeasureRequest, SourceSchema};

/// A measure request resolved against its source.
#[derive(Debug, Clone)]
pub(crate) enum ResolvedMeasure<'a> {
    Aggregate {
        key: String,
        measure: &'a Measure,
        agg: Aggregation,
    },
    Calculated {
        key: String,
        expression: String,
        /// `None` when the expression did not parse; evaluates to `0`.
        parsed: Option<CalcExpr>,
    },
}

impl ResolvedMeasure<'_> {
    pub(crate) fn key(&self) -> &str {
        match self {
            ResolvedMeasure::Aggregate { key, .. } | ResolvedMeasure::Calculated { key, .. } => {
                key
            }
        }
    }
}

pub(crate) fn resolve_measure<'a>(
    source: &'a SourceSchema,
    request: &MeasureRequest,
) -> Result<ResolvedMeasure<'a>> {
    match request.kind {
        MeasureKind::Calculated => {
            let expression = request
                .expression
                .clone()
                .or_else(|| request.field.clone())
                .unwrap_or_default();
            let key = request
                .alias
                .clone()
                .or_else(|| request.field.clone())
                .ok_or_else(|| {
                    LumenError::Validation(format!(
                        "calculated measure '{expression}' needs an alias"
                    ))
                })?;
            let parsed = match CalcExpr::parse(&expression) {
                Ok(expr) => Some(expr),
                Err(err) => {
                    tracing::warn!(alias = %key, error = %err, "calculated measure will evaluate to 0");
                    None
                }
            };
            Ok(ResolvedMeasure::Calculated {
                key,
                expression,
                parsed,
            })
        }
        MeasureKind::Aggregate => {
            let field = request.field.as_deref().ok_or_else(|| {
                LumenError::Validation("measure request is missing a field".to_string())
            })?;
            let measure = source.measures.get(field).ok_or_else(|| {
                LumenError::InvalidField(format!(
                    "unknown measure '{field}' on source '{}'",
                    source.name
                ))
            })?;
            let agg = request
                .aggregation
                .as_deref()
                .map(Aggregation::from_name)
                .unwrap_or(measure.default_agg);
            Ok(ResolvedMeasure::Aggregate {
                key: request.alias.clone().unwrap_or_else(|| field.to_string()),
                measure,
                agg,
            })
        }
    }
}
