//! Generic list-options and their translation to SQL
//!
//! Every store query accepts a [`ListOptions`]: filters (column/operator/
//! values), sorts, field projections and pagination. Values are always bound
//! as parameters; column and field names are validated by the API layer
//! against per-resource whitelists before they get here.

use serde::{Deserialize, Serialize};

/// Comparison operator of a filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FilterOperator {
    #[default]
    Eq,
    Gt,
    Lt,
    Gte,
    Lte,
}

impl FilterOperator {
    pub fn code(&self) -> &'static str {
        match self {
            FilterOperator::Eq => "=",
            FilterOperator::Gt => ">",
            FilterOperator::Lt => "<",
            FilterOperator::Gte => ">=",
            FilterOperator::Lte => "<=",
        }
    }
}

/// One filter; multiple values OR together, multiple filters AND together
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FilterOption {
    pub column: String,
    pub operator: FilterOperator,
    pub values: Vec<String>,
}

impl FilterOption {
    pub fn eq(column: impl Into<String>, values: Vec<String>) -> Self {
        Self {
            column: column.into(),
            operator: FilterOperator::Eq,
            values,
        }
    }
}

/// One sort column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortOption {
    pub column: String,
    pub is_asc: bool,
}

/// Projection of the star-select onto explicit `resource.field` columns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldsOption {
    pub resource: String,
    pub fields: Vec<String>,
}

/// Limit/offset pair; values are bound as parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pagination {
    pub limit: String,
    pub offset: String,
}

/// Options accepted by every listing query
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ListOptions {
    pub filters: Vec<FilterOption>,
    pub sorts: Vec<SortOption>,
    pub fields: Vec<FieldsOption>,
    pub pagination: Option<Pagination>,
}

/// Translate `options` against a base query like `SELECT * FROM jobs`.
/// Returns the final SQL and the bind values in placeholder order.
pub fn convert_list_options_to_query(
    options: &ListOptions,
    base: &str,
) -> (String, Vec<String>) {
    let (mut q, mut params) = add_where(&options.filters, base);
    q = add_order_by(&options.sorts, q);
    q = replace_star_select(&options.fields, q);
    add_pagination(options.pagination.as_ref(), q, &mut params)
}

/// Like [`convert_list_options_to_query`] but for base queries that already
/// carry a WHERE clause and bound params of their own.
pub fn append_options_to_query(
    options: &ListOptions,
    base: &str,
    in_params: Vec<String>,
) -> (String, Vec<String>) {
    let (mut q, params) = add_where(&options.filters, base);
    let mut out_params = in_params;
    out_params.extend(params);
    q = add_order_by(&options.sorts, q);
    q = replace_star_select(&options.fields, q);
    add_pagination(options.pagination.as_ref(), q, &mut out_params)
}

fn add_where(filters: &[FilterOption], q: &str) -> (String, Vec<String>) {
    let mut params = Vec::new();
    if filters.is_empty() {
        return (q.to_string(), params);
    }

    let mut where_parts = Vec::with_capacity(filters.len());
    for filter in filters {
        if filter.values.len() == 1 {
            where_parts.push(format!("{} {} ?", filter.column, filter.operator.code()));
            params.push(filter.values[0].clone());
        } else {
            let or_parts: Vec<String> = filter
                .values
                .iter()
                .map(|value| {
                    params.push(value.clone());
                    format!("{} {} ?", filter.column, filter.operator.code())
                })
                .collect();
            where_parts.push(format!("({})", or_parts.join(" OR ")));
        }
    }

    let concat = if q.to_uppercase().contains(" WHERE ") {
        " AND "
    } else {
        " WHERE "
    };

    (
        format!("{}{}{} ", q, concat, where_parts.join(" AND ")),
        params,
    )
}

fn add_order_by(sorts: &[SortOption], q: String) -> String {
    if sorts.is_empty() {
        return q;
    }

    let order_by: Vec<String> = sorts
        .iter()
        .map(|sort| {
            let direction = if sort.is_asc { "ASC" } else { "DESC" };
            format!("{} {}", sort.column, direction)
        })
        .collect();

    let q = if q.ends_with(' ') { q } else { format!("{} ", q) };
    format!("{}ORDER BY {}", q, order_by.join(", "))
}

fn replace_star_select(fields: &[FieldsOption], q: String) -> String {
    if !q.to_uppercase().starts_with("SELECT * ") || fields.is_empty() {
        return q;
    }

    let mut projected = Vec::new();
    for fo in fields {
        for field in &fo.fields {
            projected.push(format!("{}.{}", fo.resource, field));
        }
    }

    q.replacen('*', &projected.join(", "), 1)
}

fn add_pagination(
    pagination: Option<&Pagination>,
    q: String,
    params: &mut Vec<String>,
) -> (String, Vec<String>) {
    let Some(pagination) = pagination else {
        return (q, std::mem::take(params));
    };

    params.push(pagination.limit.clone());
    params.push(pagination.offset.clone());
    let q = if q.ends_with(' ') { q } else { format!("{} ", q) };
    (format!("{}LIMIT ? OFFSET ?", q), std::mem::take(params))
}
