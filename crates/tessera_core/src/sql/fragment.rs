//! Incremental construction of nested SELECT statements.

use super::dialect::SqlDialect;

/// Clauses in the order SQL evaluates them.
///
/// A clause can only be added to a fragment whose latest clause comes earlier
/// in this order, otherwise the fragment is first wrapped as a subquery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    From,
    Where,
    Group,
    Select,
    Distinct,
    Order,
    Offset,
    Limit,
}

#[derive(Debug, Clone)]
enum Source {
    Table(String),
    Query(String),
}

#[derive(Debug, Clone)]
pub struct SqlFragment {
    source: Source,
    alias: String,
    depth: usize,
    index_hint: Option<String>,
    filter: Option<String>,
    group_by: Vec<String>,
    select: Option<Vec<String>>,
    distinct: bool,
    order_by: Vec<String>,
    offset: Option<usize>,
    limit: Option<usize>,
    stage: Stage,
}

impl SqlFragment {
    pub fn table(name: impl Into<String>) -> Self {
        Self::from_source(Source::Table(name.into()), 0)
    }

    fn from_source(source: Source, depth: usize) -> Self {
        SqlFragment {
            source,
            alias: format!("T{depth}"),
            depth,
            index_hint: None,
            filter: None,
            group_by: Vec::new(),
            select: None,
            distinct: false,
            order_by: Vec::new(),
            offset: None,
            limit: None,
            stage: Stage::From,
        }
    }

    /// Alias column references at this level are qualified with.
    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Name of the table when this fragment selects straight from one.
    pub fn base_table(&self) -> Option<&str> {
        match (&self.source, self.stage) {
            (Source::Table(name), Stage::From) => Some(name),
            _ => None,
        }
    }

    /// Fragment that can accept a clause of `stage`, wrapping this one as a
    /// subquery when needed.
    pub fn ready_for(&self, stage: Stage, dialect: &dyn SqlDialect) -> SqlFragment {
        if self.stage < stage {
            self.clone()
        } else {
            self.wrapped(dialect)
        }
    }

    pub fn wrapped(&self, dialect: &dyn SqlDialect) -> SqlFragment {
        Self::from_source(Source::Query(self.sql(dialect)), self.depth + 1)
    }

    /// Add a WHERE condition, combined with an existing one.
    pub fn filter(&self, condition: String, dialect: &dyn SqlDialect) -> SqlFragment {
        if self.stage == Stage::Where {
            let mut out = self.clone();
            out.filter = Some(match out.filter.take() {
                Some(existing) => format!("({existing} AND {condition})"),
                None => condition,
            });
            return out;
        }
        let mut out = self.ready_for(Stage::Where, dialect);
        out.filter = Some(condition);
        out.stage = Stage::Where;
        out
    }

    /// Force the table to be read through `hint`. Only valid on a fragment
    /// returned by [`SqlFragment::table`].
    pub fn with_index_hint(&self, hint: String) -> Option<SqlFragment> {
        self.base_table()?;
        let mut out = self.clone();
        out.index_hint = Some(hint);
        Some(out)
    }

    /// Set the select list. Must be called on a fragment returned from
    /// `ready_for(Stage::Select)`.
    pub fn select(&self, list: Vec<String>) -> SqlFragment {
        let mut out = self.clone();
        out.select = Some(list);
        out.stage = Stage::Select;
        out
    }

    /// Grouped select. Must be called on a fragment returned from
    /// `ready_for(Stage::Group)`.
    pub fn group(&self, group_by: Vec<String>, list: Vec<String>) -> SqlFragment {
        let mut out = self.clone();
        out.group_by = group_by;
        out.select = Some(list);
        out.stage = Stage::Select;
        out
    }

    pub fn distinct(&self, dialect: &dyn SqlDialect) -> SqlFragment {
        if self.distinct {
            return self.clone();
        }
        let mut out = self.ready_for(Stage::Distinct, dialect);
        out.distinct = true;
        out.stage = Stage::Distinct;
        out
    }

    /// Add sort keys. Keys added later take precedence over earlier ones.
    ///
    /// Must be called on a fragment returned from `ready_for(Stage::Order)`,
    /// or on one that is already sorted.
    pub fn order(&self, keys: Vec<String>) -> SqlFragment {
        let mut out = self.clone();
        let mut order_by = keys;
        order_by.append(&mut out.order_by);
        out.order_by = order_by;
        out.stage = Stage::Order;
        out
    }

    pub fn offset(&self, n: usize, dialect: &dyn SqlDialect) -> SqlFragment {
        if self.stage == Stage::Offset {
            let mut out = self.clone();
            out.offset = Some(out.offset.unwrap_or(0).saturating_add(n));
            return out;
        }
        let mut out = self.ready_for(Stage::Offset, dialect);
        out.offset = Some(n);
        out.stage = Stage::Offset;
        out
    }

    pub fn limit(&self, n: usize, dialect: &dyn SqlDialect) -> SqlFragment {
        if self.stage == Stage::Limit {
            let mut out = self.clone();
            out.limit = Some(out.limit.map_or(n, |l| l.min(n)));
            return out;
        }
        let mut out = self.ready_for(Stage::Limit, dialect);
        out.limit = Some(n);
        out.stage = Stage::Limit;
        out
    }

    /// All rows of both fragments.
    pub fn union_all(&self, other: &SqlFragment, dialect: &dyn SqlDialect) -> SqlFragment {
        let depth = self.depth.max(other.depth) + 1;
        let sql = format!(
            "SELECT * FROM ({}) AS {} UNION ALL SELECT * FROM ({}) AS {}",
            self.sql(dialect),
            dialect.quote_identifier(&format!("U{depth}A")),
            other.sql(dialect),
            dialect.quote_identifier(&format!("U{depth}B")),
        );
        Self::from_source(Source::Query(sql), depth)
    }

    pub fn sql(&self, dialect: &dyn SqlDialect) -> String {
        let mut sql = String::from("SELECT ");
        if self.distinct {
            sql.push_str("DISTINCT ");
        }
        match &self.select {
            Some(list) if !list.is_empty() => sql.push_str(&list.join(", ")),
            _ => sql.push('*'),
        }

        let alias = dialect.quote_identifier(&self.alias);
        match &self.source {
            Source::Table(name) => {
                sql.push_str(&format!(" FROM {} AS {alias}", dialect.table_identifier(name)));
                if let Some(hint) = &self.index_hint {
                    sql.push(' ');
                    sql.push_str(hint);
                }
            }
            Source::Query(query) => sql.push_str(&format!(" FROM ({query}) AS {alias}")),
        }

        if let Some(filter) = &self.filter {
            sql.push_str(&format!(" WHERE {filter}"));
        }
        if !self.group_by.is_empty() {
            sql.push_str(&format!(" GROUP BY {}", self.group_by.join(", ")));
        }
        if !self.order_by.is_empty() {
            sql.push_str(&format!(" ORDER BY {}", self.order_by.join(", ")));
        }
        if let Some(clause) = dialect.limit_offset_to_sql(self.limit, self.offset) {
            sql.push(' ');
            sql.push_str(&clause);
        }
        sql
    }
}
