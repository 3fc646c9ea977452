//! Physical plan
//!
//! A plan is a tree of operator descriptions bound to one dataset
//! generation. Rendering is deterministic, so the same query against the same
//! generation always prints the same plan.

use std::fmt;
use std::sync::Arc;

use arrow::datatypes::{Field, Schema as ArrowSchema, SchemaRef};

use super::expr::PhysicalExpr;
use crate::catalog::{ColumnType, GenerationId};
use crate::dsl::AggregateFunc;

/// A contiguous byte range of row keys
#[derive(Debug, Clone, PartialEq)]
pub struct KeyRange {
    pub lower: Vec<u8>,
    /// Exclusive
    pub upper: Vec<u8>,
    /// Pushed-down conditions, for display
    pub conditions: Vec<String>,
}

impl KeyRange {
    pub fn is_full(&self) -> bool {
        self.conditions.is_empty()
    }
}

/// An output column
#[derive(Debug, Clone, PartialEq)]
pub struct OutputColumn {
    pub name: String,
    pub column_type: ColumnType,
}

impl OutputColumn {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
        }
    }
}

/// Arrow schema for a list of output columns; every field is nullable
pub fn arrow_schema(columns: &[OutputColumn]) -> SchemaRef {
    let fields: Vec<Field> = columns
        .iter()
        .map(|c| Field::new(&c.name, c.column_type.arrow_type(), true))
        .collect();
    Arc::new(ArrowSchema::new(fields))
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScanNode {
    pub dataset: String,
    pub generation: GenerationId,
    /// Schema positions materialized, ascending
    pub projection: Vec<usize>,
    /// Name and type of each materialized column
    pub columns: Vec<OutputColumn>,
    pub range: KeyRange,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregateExpr {
    pub func: AggregateFunc,
    /// None for `count(*)`
    pub arg: Option<PhysicalExpr>,
    pub name: String,
    pub output_type: ColumnType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SortKey {
    /// Input column index
    pub index: usize,
    pub name: String,
    pub ascending: bool,
}

/// Plan operators
#[derive(Debug, Clone, PartialEq)]
pub enum PlanNode {
    Scan(ScanNode),
    Filter {
        input: Box<PlanNode>,
        predicate: PhysicalExpr,
    },
    Project {
        input: Box<PlanNode>,
        exprs: Vec<(String, PhysicalExpr)>,
    },
    Aggregate {
        input: Box<PlanNode>,
        group_by: Vec<(String, PhysicalExpr)>,
        aggregates: Vec<AggregateExpr>,
    },
    Sort {
        input: Box<PlanNode>,
        keys: Vec<SortKey>,
    },
    Limit {
        input: Box<PlanNode>,
        limit: Option<u64>,
        offset: u64,
    },
}

impl PlanNode {
    pub fn input(&self) -> Option<&PlanNode> {
        match self {
            PlanNode::Scan(_) => None,
            PlanNode::Filter { input, .. }
            | PlanNode::Project { input, .. }
            | PlanNode::Aggregate { input, .. }
            | PlanNode::Sort { input, .. }
            | PlanNode::Limit { input, .. } => Some(input),
        }
    }

    /// Columns this node produces
    pub fn columns(&self) -> Vec<OutputColumn> {
        match self {
            PlanNode::Scan(scan) => scan.columns.clone(),
            PlanNode::Project { exprs, .. } => exprs
                .iter()
                .map(|(name, expr)| OutputColumn::new(name.clone(), expr.column_type()))
                .collect(),
            PlanNode::Aggregate {
                group_by,
                aggregates,
                ..
            } => group_by
                .iter()
                .map(|(name, expr)| OutputColumn::new(name.clone(), expr.column_type()))
                .chain(
                    aggregates
                        .iter()
                        .map(|a| OutputColumn::new(a.name.clone(), a.output_type)),
                )
                .collect(),
            PlanNode::Filter { input, .. }
            | PlanNode::Sort { input, .. }
            | PlanNode::Limit { input, .. } => input.columns(),
        }
    }

    /// The scan at the bottom of the tree
    pub fn scan(&self) -> Option<&ScanNode> {
        match self {
            PlanNode::Scan(scan) => Some(scan),
            other => other.input().and_then(PlanNode::scan),
        }
    }

    fn fmt_indented(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        write!(f, "{:width$}", "", width = depth * 2)?;
        match self {
            PlanNode::Scan(scan) => {
                let names: Vec<&str> = scan.columns.iter().map(|c| c.name.as_str()).collect();
                write!(
                    f,
                    "Scan: {} generation={} columns=[{}]",
                    scan.dataset,
                    scan.generation,
                    names.join(", ")
                )?;
                if !scan.range.is_full() {
                    write!(f, " range=[{}]", scan.range.conditions.join(" AND "))?;
                }
                return writeln!(f);
            }
            PlanNode::Filter { predicate, .. } => writeln!(f, "Filter: {}", predicate)?,
            PlanNode::Project { exprs, .. } => {
                let items: Vec<String> = exprs
                    .iter()
                    .map(|(name, expr)| {
                        let rendered = expr.to_string();
                        if &rendered == name {
                            rendered
                        } else {
                            format!("{} AS {}", rendered, name)
                        }
                    })
                    .collect();
                writeln!(f, "Project: {}", items.join(", "))?;
            }
            PlanNode::Aggregate {
                group_by,
                aggregates,
                ..
            } => {
                let groups: Vec<&str> = group_by.iter().map(|(n, _)| n.as_str()).collect();
                let aggs: Vec<String> = aggregates
                    .iter()
                    .map(|a| match &a.arg {
                        Some(arg) => format!("{}({})", a.func, arg),
                        None => format!("{}(*)", a.func),
                    })
                    .collect();
                writeln!(
                    f,
                    "Aggregate: group=[{}] aggregates=[{}]",
                    groups.join(", "),
                    aggs.join(", ")
                )?;
            }
            PlanNode::Sort { keys, .. } => {
                let items: Vec<String> = keys
                    .iter()
                    .map(|k| format!("{} {}", k.name, if k.ascending { "ASC" } else { "DESC" }))
                    .collect();
                writeln!(f, "Sort: {}", items.join(", "))?;
            }
            PlanNode::Limit { limit, offset, .. } => match limit {
                Some(n) => writeln!(f, "Limit: {} offset={}", n, offset)?,
                None => writeln!(f, "Limit: none offset={}", offset)?,
            },
        }
        match self.input() {
            Some(input) => input.fmt_indented(f, depth + 1),
            None => Ok(()),
        }
    }
}

/// A compiled query
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub dataset: String,
    pub generation: GenerationId,
    pub root: PlanNode,
    pub output: Vec<OutputColumn>,
}

impl Plan {
    pub fn output_schema(&self) -> SchemaRef {
        arrow_schema(&self.output)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.output.iter().map(|c| c.name.clone()).collect()
    }

    pub fn scan(&self) -> Option<&ScanNode> {
        self.root.scan()
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.root.fmt_indented(f, 0)
    }
}
