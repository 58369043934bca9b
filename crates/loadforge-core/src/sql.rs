//! The narrow SQL capability a workload is written against.
//!
//! Concrete database client adapters (MySQL, Postgres, SQLite wire drivers)
//! are out of scope here; this module only defines the contract a workload
//! leaf calls into, plus the expression AST its `where`/`set` clauses build.

use std::fmt;

/// A column's storage type.
#[derive(Debug, Clone, PartialEq)]
pub enum DataType {
    /// An integer column, optionally auto-incrementing.
    Int { auto_increment: bool },
    /// A floating point column.
    Float,
    /// A text column, fixed- or variable-length.
    String { fixed_length: bool, length: u32 },
    /// A boolean column.
    Bool,
}

/// A column description within a [`Table`].
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    /// Column name.
    pub name: String,
    /// Column storage type.
    pub data_type: DataType,
    /// Whether this column is (part of) the primary key.
    pub primary_key: bool,
}

impl Column {
    /// Build a new column description.
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            primary_key: false,
        }
    }

    /// Mark this column as (part of) the primary key.
    pub fn primary(mut self) -> Self {
        self.primary_key = true;
        self
    }
}

/// A table schema: a name plus an ordered list of columns.
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    /// Table name.
    pub name: String,
    /// Column descriptions, in declaration order.
    pub columns: Vec<Column>,
}

impl Table {
    /// Build a table schema.
    pub fn new(name: impl Into<String>, columns: Vec<Column>) -> Self {
        Self {
            name: name.into(),
            columns,
        }
    }

    /// Look up a column by name.
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// A literal value in an expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    /// Integer literal.
    Int(i64),
    /// Floating point literal.
    Float(f64),
    /// Text literal.
    Str(String),
    /// Boolean literal.
    Bool(bool),
    /// SQL `NULL`.
    Null,
}

/// A unary operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    /// Logical negation.
    Not,
    /// Aggregate sum.
    Sum,
    /// Aggregate count.
    Count,
}

/// A binary operator.
///
/// `Eq` is SQL equality (`==` in the source grammar this AST is modeled on);
/// `Assign` is the `=` used on the left-hand side of an `UPDATE ... SET`
/// clause. The two are deliberately distinct variants: conflating them was
/// a known source of ambiguity in the system this AST replaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/`
    Div,
    /// `==`, equality (a predicate).
    Eq,
    /// `=`, assignment (only valid with a column on the left).
    Assign,
    /// `!=`
    NotEq,
    /// `>`
    Gt,
    /// `<`
    Lt,
    /// `>=`
    Ge,
    /// `<=`
    Le,
    /// `AND`
    And,
    /// `OR`
    Or,
}

/// A SQL expression tree: columns, literals, and unary/binary operations.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Reference to a column by name.
    Column(String),
    /// A literal value.
    Literal(Literal),
    /// A unary operation.
    Unary(UnaryOp, Box<Expr>),
    /// A binary operation.
    Binary(Box<Expr>, BinaryOp, Box<Expr>),
}

impl Expr {
    /// Build `lhs op rhs`.
    pub fn binary(lhs: Expr, op: BinaryOp, rhs: Expr) -> Self {
        Expr::Binary(Box::new(lhs), op, Box::new(rhs))
    }

    /// Build `op expr`.
    pub fn unary(op: UnaryOp, expr: Expr) -> Self {
        Expr::Unary(op, Box::new(expr))
    }

    /// Build a `column = value` assignment, as used in `UPDATE ... SET`.
    ///
    /// Panics if `column` would not evaluate to a bare column reference;
    /// callers should pass the column name directly.
    pub fn assign(column: impl Into<String>, value: Expr) -> Self {
        Expr::binary(Expr::Column(column.into()), BinaryOp::Assign, value)
    }

    /// Build a `lhs == rhs` equality predicate.
    pub fn eq(lhs: Expr, rhs: Expr) -> Self {
        Expr::binary(lhs, BinaryOp::Eq, rhs)
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Column(name) => write!(f, "{name}"),
            Expr::Literal(Literal::Int(v)) => write!(f, "{v}"),
            Expr::Literal(Literal::Float(v)) => write!(f, "{v}"),
            Expr::Literal(Literal::Str(v)) => write!(f, "'{v}'"),
            Expr::Literal(Literal::Bool(v)) => write!(f, "{v}"),
            Expr::Literal(Literal::Null) => write!(f, "NULL"),
            Expr::Unary(op, value) => write!(f, "({op:?} {value})"),
            Expr::Binary(lhs, op, rhs) => write!(f, "({lhs} {op:?} {rhs})"),
        }
    }
}

/// Error surfaced by a [`SqlBackend`] implementation.
///
/// Backend failures surface as this single typed error; workloads catch it
/// at the leaf and convert it into a tasklet failure rather than aborting.
#[derive(Debug, thiserror::Error)]
#[error("sql backend error: {0}")]
pub struct SqlError(pub String);

/// A row of returned values from `select`.
pub type Row = Vec<Literal>;

/// The narrow SQL capability a workload leaf is written against.
///
/// Implementations adapt a concrete database client; none is provided here.
pub trait SqlBackend: Send + Sync {
    /// Create a table, failing if it already exists.
    fn create_table(&self, table: &Table) -> Result<(), SqlError>;

    /// Drop a table. Must not fail if the table is already absent.
    fn drop_table(&self, table: &Table) -> Result<(), SqlError>;

    /// Insert one row.
    fn insert(&self, table: &Table, values: &[Literal]) -> Result<(), SqlError>;

    /// Update rows matching `where_clause` (all rows if `None`).
    fn update(
        &self,
        table: &Table,
        set_statements: &[Expr],
        where_clause: Option<&Expr>,
    ) -> Result<(), SqlError>;

    /// Select rows from `tables`, returning `columns`.
    fn select(
        &self,
        tables: &[&Table],
        columns: &[&str],
        where_clause: Option<&Expr>,
        order_by: Option<&[&str]>,
        distinct: bool,
    ) -> Result<Vec<Row>, SqlError>;

    /// Delete rows matching `where_clause` (all rows if `None`).
    fn delete_rows(&self, table: &Table, where_clause: Option<&Expr>) -> Result<(), SqlError>;

    /// Begin a transaction.
    fn start_transaction(&self) -> Result<(), SqlError>;

    /// Commit the current transaction.
    fn commit_transaction(&self) -> Result<(), SqlError>;

    /// Abort the current transaction.
    fn abort_transaction(&self) -> Result<(), SqlError>;

    /// Create an index on `columns` of `table`.
    fn create_index(&self, index_name: &str, table: &Table, columns: &[&str])
        -> Result<(), SqlError>;

    /// The last value generated by an auto-increment column.
    fn last_auto_increment(&self) -> Result<i64, SqlError>;

    /// Bulk-load rows, wrapped in a single transaction by default.
    ///
    /// Implementations may override this with a backend-specific fast path
    /// (e.g. `COPY`/`LOAD DATA`); the default falls back to per-row inserts.
    fn bulk_load(&self, table: &Table, rows: &mut dyn Iterator<Item = Vec<Literal>>) -> Result<(), SqlError> {
        self.start_transaction()?;
        for row in rows {
            self.insert(table, &row)?;
        }
        self.commit_transaction()
    }
}
