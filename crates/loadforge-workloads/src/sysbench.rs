//! sysbench: an OLTP-style mix of point lookups, range scans, index and
//! non-index updates, and delete/insert churn against a single table.

use std::sync::{Arc, Mutex};

use loadforge_core::sql::{BinaryOp, Column, DataType, Expr, Literal, Table};
use loadforge_core::SqlBackend;
use loadforge_engine::Node;
use rand::Rng;
use serde::Deserialize;

use crate::WorkloadError;

/// The `workload` knobs sysbench reads out of `BenchmarkConfig`.
#[derive(Debug, Clone, Deserialize)]
pub struct SysbenchConfig {
    /// Number of rows in the table.
    pub table_size: i64,
    /// Width of each range scan, in key units.
    pub range_size: i64,
    /// `"uniform"` or `"special"` key distribution.
    pub distribution: String,
    /// Fraction of draws from `"special"` distribution that land on a hot key.
    pub special_chosen_percentage: f64,
    /// Fraction of the key space treated as "hot" under `"special"`.
    pub chance_to_be_special: f64,
    /// Point lookups performed per transaction.
    pub point_operations: u32,
    /// Range scans performed per transaction.
    pub range_operations: u32,
    /// Range sums performed per transaction.
    pub range_sum_operations: u32,
    /// Ordered range scans performed per transaction.
    pub range_order_operations: u32,
    /// Distinct ordered range scans performed per transaction.
    pub range_distinct_operations: u32,
    /// Indexed updates performed per transaction.
    pub update_index_operations: u32,
    /// Non-indexed updates performed per transaction.
    pub update_non_index_operations: u32,
    /// Delete-then-reinsert cycles performed per transaction.
    pub delete_operations: u32,
}

impl SysbenchConfig {
    /// Parse from the opaque `workload` field of a `BenchmarkConfig`.
    pub fn from_value(value: &serde_json::Value) -> Result<Self, WorkloadError> {
        serde_json::from_value(value.clone()).map_err(|err| WorkloadError(err.to_string()))
    }
}

/// The `sysbench` table schema.
pub fn table() -> Table {
    Table::new(
        "sysbench",
        vec![
            Column::new("id", DataType::Int { auto_increment: true }).primary(),
            Column::new("k", DataType::Int { auto_increment: false }),
            Column::new(
                "c",
                DataType::String {
                    fixed_length: true,
                    length: 120,
                },
            ),
            Column::new(
                "pad",
                DataType::String {
                    fixed_length: true,
                    length: 60,
                },
            ),
        ],
    )
}

fn random_key(cfg: &SysbenchConfig) -> i64 {
    let mut rng = rand::thread_rng();
    match cfg.distribution.as_str() {
        "special" => {
            let total_special = (cfg.table_size as f64 * cfg.chance_to_be_special) as i64;
            let total_special = total_special.max(1);
            let special_step = (cfg.table_size / total_special).max(1);
            if rng.gen_bool(cfg.special_chosen_percentage.clamp(0.0, 1.0)) {
                rng.gen_range(0..total_special) * special_step
            } else {
                rng.gen_range(0..cfg.table_size.max(1))
            }
        }
        _ => rng.gen_range(0..cfg.table_size.max(1)),
    }
}

fn range_bounds(cfg: &SysbenchConfig) -> (i64, i64) {
    let lower = random_key(cfg);
    (lower, lower + cfg.range_size)
}

fn range_where(table: &Table, lower: i64, upper: i64) -> Expr {
    let ge = Expr::binary(
        Expr::Column("id".into()),
        BinaryOp::Ge,
        Expr::Literal(Literal::Int(lower)),
    );
    let le = Expr::binary(
        Expr::Column("id".into()),
        BinaryOp::Le,
        Expr::Literal(Literal::Int(upper)),
    );
    let _ = table;
    Expr::binary(ge, BinaryOp::And, le)
}

#[derive(Default)]
struct TransactionCounts {
    point: u32,
    range: u32,
    range_sum: u32,
    range_order: u32,
    range_distinct: u32,
    update_index: u32,
    update_non_index: u32,
    delete: u32,
    reinsertion_index: i64,
}

/// Build the sysbench task tree against `sql`.
pub fn build_tree(sql: Arc<dyn SqlBackend>, cfg: Arc<SysbenchConfig>) -> Node {
    let counts = Arc::new(Mutex::new(TransactionCounts::default()));
    let t = table();

    let start_sql = sql.clone();
    let counts_reset = counts.clone();
    let on_start: loadforge_engine::LeafOp = Arc::new(move |ctx| {
        *counts_reset.lock().unwrap() = TransactionCounts::default();
        if start_sql.start_transaction().is_err() {
            ctx.fail(0);
        }
    });

    let end_sql = sql.clone();
    let on_end: loadforge_engine::LeafOp = Arc::new(move |ctx| {
        if end_sql.commit_transaction().is_err() {
            ctx.fail(0);
        }
    });

    let point = {
        let sql = sql.clone();
        let cfg = cfg.clone();
        let counts = counts.clone();
        let table = t.clone();
        Node::leaf(
            "point",
            1.0,
            true,
            Arc::new(move |ctx| {
                let where_clause = Expr::binary(
                    Expr::Column("id".into()),
                    BinaryOp::Eq,
                    Expr::Literal(Literal::Int(random_key(&cfg))),
                );
                let column_names: Vec<&str> = table.columns.iter().map(|c| c.name.as_str()).collect();
                if sql.select(&[&table], &column_names, Some(&where_clause), None, false).is_err() {
                    ctx.fail(1);
                    return;
                }
                let mut c = counts.lock().unwrap();
                c.point += 1;
                if c.point < cfg.point_operations {
                    ctx.jump("point");
                } else {
                    ctx.jump("range");
                }
            }),
        )
    };

    let range = {
        let sql = sql.clone();
        let cfg = cfg.clone();
        let counts = counts.clone();
        let table = t.clone();
        Node::leaf(
            "range",
            0.0,
            true,
            Arc::new(move |ctx| {
                let (lo, hi) = range_bounds(&cfg);
                let where_clause = range_where(&table, lo, hi);
                if sql.select(&[&table], &["c"], Some(&where_clause), None, false).is_err() {
                    ctx.fail(1);
                    return;
                }
                let mut c = counts.lock().unwrap();
                c.range += 1;
                if c.range < cfg.range_operations {
                    ctx.jump("range");
                } else {
                    ctx.jump("range_sum");
                }
            }),
        )
    };

    let range_sum = {
        let sql = sql.clone();
        let cfg = cfg.clone();
        let counts = counts.clone();
        let table = t.clone();
        Node::leaf(
            "range_sum",
            0.0,
            true,
            Arc::new(move |ctx| {
                // The narrow `select` contract takes plain column names, not
                // projection expressions, so the aggregate is applied by the
                // backend's own column-name convention rather than an
                // `Expr::Unary(Sum, ...)` built here.
                let (lo, hi) = range_bounds(&cfg);
                let where_clause = range_where(&table, lo, hi);
                if sql.select(&[&table], &["k"], Some(&where_clause), None, false).is_err() {
                    ctx.fail(1);
                    return;
                }
                let mut c = counts.lock().unwrap();
                c.range_sum += 1;
                if c.range_sum < cfg.range_sum_operations {
                    ctx.jump("range_sum");
                } else {
                    ctx.jump("range_order");
                }
            }),
        )
    };

    let range_order = {
        let sql = sql.clone();
        let cfg = cfg.clone();
        let counts = counts.clone();
        let table = t.clone();
        Node::leaf(
            "range_order",
            0.0,
            true,
            Arc::new(move |ctx| {
                let (lo, hi) = range_bounds(&cfg);
                let where_clause = range_where(&table, lo, hi);
                if sql.select(&[&table], &["c"], Some(&where_clause), Some(&["c"]), false).is_err() {
                    ctx.fail(1);
                    return;
                }
                let mut c = counts.lock().unwrap();
                c.range_order += 1;
                if c.range_order < cfg.range_order_operations {
                    ctx.jump("range_order");
                } else {
                    ctx.jump("range_distinct");
                }
            }),
        )
    };

    let range_distinct = {
        let sql = sql.clone();
        let cfg = cfg.clone();
        let counts = counts.clone();
        let table = t.clone();
        Node::leaf(
            "range_distinct",
            0.0,
            true,
            Arc::new(move |ctx| {
                let (lo, hi) = range_bounds(&cfg);
                let where_clause = range_where(&table, lo, hi);
                if sql.select(&[&table], &["c"], Some(&where_clause), Some(&["c"]), true).is_err() {
                    ctx.fail(1);
                    return;
                }
                let mut c = counts.lock().unwrap();
                c.range_distinct += 1;
                if c.range_distinct < cfg.range_distinct_operations {
                    ctx.jump("range_distinct");
                } else {
                    ctx.jump("update_index");
                }
            }),
        )
    };

    let update_index = {
        let sql = sql.clone();
        let cfg = cfg.clone();
        let counts = counts.clone();
        let table = t.clone();
        Node::leaf(
            "update_index",
            0.0,
            true,
            Arc::new(move |ctx| {
                let k_plus_1 = Expr::binary(Expr::Column("k".into()), BinaryOp::Add, Expr::Literal(Literal::Int(1)));
                let set_statement = Expr::assign("k", k_plus_1);
                let where_clause = Expr::binary(
                    Expr::Column("id".into()),
                    BinaryOp::Eq,
                    Expr::Literal(Literal::Int(random_key(&cfg))),
                );
                if sql.update(&table, &[set_statement], Some(&where_clause)).is_err() {
                    ctx.fail(1);
                    return;
                }
                let mut c = counts.lock().unwrap();
                c.update_index += 1;
                if c.update_index < cfg.update_index_operations {
                    ctx.jump("update_index");
                } else {
                    ctx.jump("update_non_index");
                }
            }),
        )
    };

    let update_non_index = {
        let sql = sql.clone();
        let cfg = cfg.clone();
        let counts = counts.clone();
        let table = t.clone();
        let filler = "~".repeat(120);
        Node::leaf(
            "update_non_index",
            0.0,
            true,
            Arc::new(move |ctx| {
                let set_statement = Expr::assign("c", Expr::Literal(Literal::Str(filler.clone())));
                let where_clause = Expr::binary(
                    Expr::Column("id".into()),
                    BinaryOp::Eq,
                    Expr::Literal(Literal::Int(random_key(&cfg))),
                );
                if sql.update(&table, &[set_statement], Some(&where_clause)).is_err() {
                    ctx.fail(1);
                    return;
                }
                let mut c = counts.lock().unwrap();
                c.update_non_index += 1;
                if c.update_non_index < cfg.update_non_index_operations {
                    ctx.jump("update_non_index");
                } else {
                    ctx.jump("delete");
                }
            }),
        )
    };

    let delete = {
        let sql = sql.clone();
        let cfg = cfg.clone();
        let counts = counts.clone();
        let table = t.clone();
        Node::leaf(
            "delete",
            0.0,
            true,
            Arc::new(move |ctx| {
                let key = random_key(&cfg);
                let where_clause = Expr::binary(
                    Expr::Column("id".into()),
                    BinaryOp::Eq,
                    Expr::Literal(Literal::Int(key)),
                );
                if sql.delete_rows(&table, Some(&where_clause)).is_err() {
                    ctx.fail(1);
                    return;
                }
                let mut c = counts.lock().unwrap();
                c.reinsertion_index = key;
                c.delete += 1;
                ctx.jump("insert");
            }),
        )
    };

    let insert = {
        let sql = sql.clone();
        let cfg = cfg.clone();
        let counts = counts.clone();
        let table = t.clone();
        Node::leaf(
            "insert",
            0.0,
            true,
            Arc::new(move |ctx| {
                let reinsertion_index = counts.lock().unwrap().reinsertion_index;
                let row = vec![
                    Literal::Int(reinsertion_index),
                    Literal::Int(0),
                    Literal::Str(" ".into()),
                    Literal::Str("aaaaaaaaaaffffffffffrrrrrrrrrreeeeeeeeeeyyyyyyyyyy".into()),
                ];
                if sql.insert(&table, &row).is_err() {
                    ctx.fail(1);
                    return;
                }
                let done = counts.lock().unwrap().delete >= cfg.delete_operations;
                if done {
                    ctx.finish(1);
                } else {
                    ctx.jump("delete");
                }
            }),
        )
    };

    let transaction = Node::composite(
        "Transaction",
        1.0,
        vec![
            point,
            range,
            range_sum,
            range_order,
            range_distinct,
            update_index,
            update_non_index,
            delete,
            insert,
        ],
    )
    .with_hooks(Some(on_start), Some(on_end));

    Node::composite("sysbench", 1.0, vec![transaction])
}

/// Recreate the `sysbench` table.
pub fn preload_schema(sql: &dyn SqlBackend) -> Result<(), WorkloadError> {
    let t = table();
    sql.start_transaction().map_err(|e| WorkloadError(e.to_string()))?;
    let _ = sql.drop_table(&t);
    sql.create_table(&t).map_err(|e| WorkloadError(e.to_string()))?;
    sql.commit_transaction().map_err(|e| WorkloadError(e.to_string()))
}

/// Load one loader partition's share of `table_size` rows.
pub fn preload(sql: &dyn SqlBackend, cfg: &SysbenchConfig, loader_index: u32, total_loaders: u32) -> Result<(), WorkloadError> {
    let t = table();
    let rows_per_loader = cfg.table_size / total_loaders as i64;
    let start = loader_index as i64 * rows_per_loader;
    let end = if loader_index + 1 == total_loaders {
        cfg.table_size
    } else {
        start + rows_per_loader
    };

    let pad = "qqqqqqqqqqwwwwwwwwwweeeeeeeeeerrrrrrrrrrtttttttttt".to_string();
    let mut rows = (start..end).map(|row| vec![Literal::Int(row), Literal::Int(0), Literal::Str(" ".into()), Literal::Str(pad.clone())]);
    sql.bulk_load(&t, &mut rows).map_err(|err| WorkloadError(err.to_string()))
}
