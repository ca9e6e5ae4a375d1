//! sqlparser adapter: turns one observed SQL script into a
//! `SqlParsingResult` with table- and column-level lineage.
//!
//! The contract with the aggregator is that this module never fails hard:
//! malformed or unsupported SQL degrades to a confidence-0 result with
//! `debug_info` populated, and a statement whose column lineage cannot be
//! fully resolved still reports table-level lineage at reduced confidence.

use anyhow::{anyhow, Result};
use sqlparser::ast::{
    self, Expr, FromTable, Ident, ObjectName, ObjectNamePart, Query, Select, SelectItem, SetExpr,
    Statement, TableFactor, TableObject, TableWithJoins, Use,
};
use sqlparser::dialect::Dialect;
use sqlparser::parser::Parser;
use std::collections::{BTreeSet, HashMap};

use crate::models::{ColumnLineageInfo, ColumnRef, QueryType};
use crate::schema::SchemaResolver;
use crate::urn::UrnBuilder;

/// Confidence when every referenced schema/column resolved.
pub const CONFIDENCE_HIGH: f32 = 0.9;
/// Confidence when some column lineage had to be dropped.
pub const CONFIDENCE_PARTIAL: f32 = 0.35;
/// Confidence when only table-level lineage was attempted and degraded.
pub const CONFIDENCE_TABLE_ONLY: f32 = 0.2;

/// Everything the parser needs besides the SQL text itself.
pub struct ParserContext<'a> {
    pub dialect: &'a dyn Dialect,
    pub default_db: Option<String>,
    pub default_schema: Option<String>,
    pub urns: &'a UrnBuilder,
    pub schemas: &'a SchemaResolver,
}

/// Result of parsing one script. Reflects the last DML/DDL statement; `USE`
/// statements update the database context for the statements that follow.
#[derive(Debug, Clone)]
pub struct SqlParsingResult {
    pub query_type: QueryType,
    pub downstream: Option<String>,
    pub upstreams: BTreeSet<String>,
    pub column_lineage: Vec<ColumnLineageInfo>,
    /// Row count for `INSERT ... VALUES`, when derivable.
    pub affected_rows: Option<u64>,
    /// Downstream is session-scoped (`CREATE TEMP TABLE` or `#` prefix).
    pub is_temp_downstream: bool,
    /// Schemas observed from plain `CREATE TABLE (...)` DDL in the script.
    pub observed_schemas: Vec<(String, Vec<String>)>,
    pub confidence: f32,
    pub debug_info: Option<String>,
}

impl SqlParsingResult {
    fn empty(query_type: QueryType) -> Self {
        Self {
            query_type,
            downstream: None,
            upstreams: BTreeSet::new(),
            column_lineage: Vec::new(),
            affected_rows: None,
            is_temp_downstream: false,
            observed_schemas: Vec::new(),
            confidence: CONFIDENCE_HIGH,
            debug_info: None,
        }
    }

    fn failed(message: &str) -> Self {
        let mut res = Self::empty(QueryType::Unknown);
        res.confidence = 0.0;
        res.debug_info = Some(message.to_string());
        res
    }
}

/// Parses a script and extracts lineage. Never returns an error.
pub fn parse_statements(sql: &str, ctx: &ParserContext<'_>) -> SqlParsingResult {
    let statements = match Parser::parse_sql(ctx.dialect, sql) {
        Ok(statements) => statements,
        Err(e) => return SqlParsingResult::failed(&e.to_string()),
    };
    if statements.is_empty() {
        return SqlParsingResult::failed("empty statement");
    }

    let mut env = ScriptEnv {
        current_db: ctx.default_db.clone(),
        default_schema: ctx.default_schema.clone(),
        urns: ctx.urns,
        schemas: ctx.schemas,
        local_schemas: HashMap::new(),
    };

    let mut observed_schemas = Vec::new();
    let mut last: Option<SqlParsingResult> = None;
    for stmt in &statements {
        match analyze_statement(stmt, &mut env) {
            Ok(Some(res)) => last = Some(res),
            Ok(None) => {}
            Err(e) => {
                let mut res = SqlParsingResult::failed(&e.to_string());
                res.query_type = classify_statement(stmt);
                last = Some(res);
            }
        }
    }
    // DDL-observed schemas are surfaced even when the last statement failed,
    // so the aggregator can still enrich its resolver.
    for (urn, cols) in &env.local_schemas {
        observed_schemas.push((urn.clone(), cols.clone()));
    }
    observed_schemas.sort();

    let mut result = last.unwrap_or_else(|| SqlParsingResult::failed("no analyzable statement"));
    result.observed_schemas = observed_schemas;
    result
}

/// Script-level context threaded through statement analysis. `USE` mutates
/// the database; CREATE TABLE DDL feeds the local schema overlay consulted
/// before the aggregator-wide resolver.
struct ScriptEnv<'a> {
    current_db: Option<String>,
    default_schema: Option<String>,
    urns: &'a UrnBuilder,
    schemas: &'a SchemaResolver,
    local_schemas: HashMap<String, Vec<String>>,
}

impl ScriptEnv<'_> {
    fn schema_of(&self, urn: &str) -> Option<Vec<String>> {
        if let Some(cols) = self.local_schemas.get(urn) {
            return Some(cols.clone());
        }
        self.schemas.resolve(urn).map(|c| c.to_vec())
    }

    /// Qualifies a 1/2/3-part object name against the session defaults and
    /// builds the dataset urn. Infallible: missing defaults just shorten the
    /// qualified name.
    fn table_urn(&self, name: &ObjectName) -> String {
        let parts = object_name_parts(name);
        let db = self.current_db.as_deref().unwrap_or("");
        let schema = self.default_schema.as_deref().unwrap_or("");
        let qualified = match parts.len() {
            1 => self.urns.qualified_name(&[db, schema, &parts[0]]),
            2 => {
                if self.default_schema.is_some() {
                    self.urns.qualified_name(&[db, &parts[0], &parts[1]])
                } else {
                    self.urns.qualified_name(&[&parts[0], &parts[1]])
                }
            }
            _ => {
                let refs: Vec<&str> = parts.iter().map(|p| p.as_str()).collect();
                self.urns.qualified_name(&refs)
            }
        };
        self.urns.dataset_urn(&qualified)
    }
}

fn ident_to_string(ident: &Ident) -> String {
    ident.value.clone()
}

fn object_name_parts(name: &ObjectName) -> Vec<String> {
    name.0
        .iter()
        .filter_map(|part| match part {
            ObjectNamePart::Identifier(ident) => Some(ident_to_string(ident)),
            _ => None,
        })
        .collect()
}

fn object_name_leaf(name: &ObjectName) -> String {
    object_name_parts(name).pop().unwrap_or_default()
}

fn classify_statement(stmt: &Statement) -> QueryType {
    match stmt {
        Statement::Query(_) => QueryType::Select,
        Statement::Insert(_) => QueryType::Insert,
        Statement::CreateTable(ct) if ct.query.is_some() => QueryType::CreateTableAsSelect,
        Statement::CreateTable(_) => QueryType::CreateOther,
        Statement::CreateView { .. } => QueryType::CreateView,
        Statement::Merge { .. } => QueryType::Merge,
        Statement::Update { .. } => QueryType::Update,
        Statement::Delete(_) => QueryType::Delete,
        Statement::Drop { .. } => QueryType::Drop,
        _ => QueryType::Unknown,
    }
}

fn analyze_statement(stmt: &Statement, env: &mut ScriptEnv<'_>) -> Result<Option<SqlParsingResult>> {
    match stmt {
        Statement::Use(u) => {
            if let Some(db) = use_to_db(u) {
                env.current_db = Some(db);
            }
            Ok(None)
        }
        Statement::CreateTable(ct) => {
            let target_urn = env.table_urn(&ct.name);
            if !ct.columns.is_empty() {
                let cols = ct.columns.iter().map(|c| ident_to_string(&c.name)).collect();
                env.local_schemas.insert(target_urn.clone(), cols);
            }
            let is_temp = ct.temporary || object_name_leaf(&ct.name).starts_with('#');
            match ct.query.as_ref() {
                Some(query) => {
                    let mut res =
                        analyze_write_query(query, &target_urn, &[], QueryType::CreateTableAsSelect, env)?;
                    res.is_temp_downstream = is_temp;
                    // Remember the CTAS output shape for later wildcards.
                    if !res.column_lineage.is_empty() {
                        env.local_schemas.entry(target_urn).or_insert_with(|| {
                            res.column_lineage.iter().map(|c| c.downstream.column.clone()).collect()
                        });
                    }
                    Ok(Some(res))
                }
                None => {
                    // Plain DDL: downstream exists, no upstreams.
                    let mut res = SqlParsingResult::empty(QueryType::CreateOther);
                    res.downstream = Some(target_urn);
                    res.is_temp_downstream = is_temp;
                    Ok(Some(res))
                }
            }
        }
        Statement::Insert(ins) => {
            let target_urn = match &ins.table {
                TableObject::TableName(name) => env.table_urn(name),
                TableObject::TableFunction(_) => {
                    return Err(anyhow!("unsupported INSERT target: table function"))
                }
            };
            let explicit_cols: Vec<String> = ins.columns.iter().map(ident_to_string).collect();
            let source = match ins.source.as_ref() {
                Some(source) => source,
                None => {
                    let mut res = SqlParsingResult::empty(QueryType::Insert);
                    res.downstream = Some(target_urn);
                    return Ok(Some(res));
                }
            };
            if let SetExpr::Values(values) = source.body.as_ref() {
                let mut res = SqlParsingResult::empty(QueryType::Insert);
                res.downstream = Some(target_urn);
                res.affected_rows = Some(values.rows.len() as u64);
                return Ok(Some(res));
            }
            let res = analyze_write_query(source, &target_urn, &explicit_cols, QueryType::Insert, env)?;
            Ok(Some(res))
        }
        Statement::CreateView {
            name,
            columns,
            query,
            ..
        } => {
            let target_urn = env.table_urn(name);
            let explicit_cols: Vec<String> =
                columns.iter().map(|c| ident_to_string(&c.name)).collect();
            let res = analyze_write_query(query, &target_urn, &explicit_cols, QueryType::CreateView, env)?;
            if !res.column_lineage.is_empty() {
                env.local_schemas.entry(target_urn).or_insert_with(|| {
                    res.column_lineage.iter().map(|c| c.downstream.column.clone()).collect()
                });
            }
            Ok(Some(res))
        }
        Statement::Query(query) => {
            let mut res = SqlParsingResult::empty(QueryType::Select);
            collect_query_tables(query, env, &mut res.upstreams);
            Ok(Some(res))
        }
        Statement::Merge { table, source, .. } => {
            let mut res = SqlParsingResult::empty(QueryType::Merge);
            res.downstream = table_factor_urn(table, env);
            collect_factor_tables(source, env, &mut res.upstreams);
            Ok(Some(res))
        }
        Statement::Update { table, .. } => {
            let mut res = SqlParsingResult::empty(QueryType::Update);
            res.downstream = table_factor_urn(&table.relation, env);
            for join in &table.joins {
                collect_factor_tables(&join.relation, env, &mut res.upstreams);
            }
            Ok(Some(res))
        }
        Statement::Delete(del) => {
            let tables = match &del.from {
                FromTable::WithFromKeyword(tables) | FromTable::WithoutKeyword(tables) => tables,
            };
            let mut res = SqlParsingResult::empty(QueryType::Delete);
            res.downstream = tables.first().and_then(|t| table_factor_urn(&t.relation, env));
            Ok(Some(res))
        }
        Statement::Drop {
            object_type, names, ..
        } if matches!(object_type, ast::ObjectType::Table | ast::ObjectType::View) => {
            let mut res = SqlParsingResult::empty(QueryType::Drop);
            res.downstream = names.first().map(|n| env.table_urn(n));
            Ok(Some(res))
        }
        _ => Ok(None),
    }
}

fn use_to_db(u: &Use) -> Option<String> {
    let name = match u {
        Use::Catalog(name)
        | Use::Schema(name)
        | Use::Database(name)
        | Use::Warehouse(name)
        | Use::Role(name)
        | Use::Object(name) => Some(name),
        _ => None,
    }?;
    object_name_parts(name).pop()
}

/// Analyzes a SELECT feeding a write target and assembles the parsing result
/// with column lineage zipped against the target column list.
fn analyze_write_query(
    query: &Query,
    target_urn: &str,
    explicit_cols: &[String],
    query_type: QueryType,
    env: &ScriptEnv<'_>,
) -> Result<SqlParsingResult> {
    let info = analyze_query(query, env)?;

    let mut res = SqlParsingResult::empty(query_type);
    res.downstream = Some(target_urn.to_string());
    res.upstreams = info.tables.clone();

    let target_cols: Vec<String> = if !explicit_cols.is_empty() {
        explicit_cols.to_vec()
    } else if let Some(cols) = env.schema_of(target_urn) {
        cols
    } else {
        info.columns.clone()
    };

    let mut partial = info.partial;
    if target_cols.len() != info.columns.len() && !info.columns.is_empty() {
        partial = true;
        res.debug_info = Some(format!(
            "target column count {} does not match projection count {}",
            target_cols.len(),
            info.columns.len()
        ));
    }

    res.confidence = if partial { CONFIDENCE_PARTIAL } else { CONFIDENCE_HIGH };
    if info.columns.is_empty() && !info.tables.is_empty() {
        // Table-level lineage only (set operations, unexpandable wildcards).
        res.confidence = CONFIDENCE_TABLE_ONLY;
    }

    for (i, target_col) in target_cols.iter().enumerate() {
        let Some(Some(sources)) = info.sources.get(i) else {
            continue;
        };
        if sources.is_empty() {
            continue;
        }
        let upstreams: BTreeSet<ColumnRef> = sources
            .iter()
            .map(|c| ColumnRef {
                table: c.table.clone(),
                column: fold_column(env, &c.column),
            })
            .collect();
        res.column_lineage.push(ColumnLineageInfo {
            downstream: ColumnRef {
                table: target_urn.to_string(),
                column: fold_column(env, target_col),
            },
            upstreams: upstreams.into_iter().collect(),
            transform: info.exprs.get(i).cloned().flatten(),
            confidence: res.confidence,
        });
    }
    Ok(res)
}

fn fold_column(env: &ScriptEnv<'_>, column: &str) -> String {
    if env.urns.lowercase() {
        column.to_lowercase()
    } else {
        column.to_string()
    }
}

/// Output shape of a SELECT: projection names, per-slot column sources,
/// per-slot transform expressions, and every base table in scope.
#[derive(Debug, Default, Clone)]
struct SelectInfo {
    columns: Vec<String>,
    sources: Vec<Option<BTreeSet<ColumnRef>>>,
    exprs: Vec<Option<String>>,
    tables: BTreeSet<String>,
    partial: bool,
}

/// Column mapping of a CTE or derived table: output column -> base sources.
#[derive(Debug, Default, Clone)]
struct VirtualTable {
    columns: Vec<String>,
    sources: HashMap<String, BTreeSet<ColumnRef>>,
    tables: BTreeSet<String>,
}

impl VirtualTable {
    fn from_select_info(columns: Vec<String>, info: &SelectInfo) -> Self {
        let mut sources = HashMap::new();
        for (i, col) in columns.iter().enumerate() {
            if let Some(Some(srcs)) = info.sources.get(i) {
                sources.insert(col.clone(), srcs.clone());
            }
        }
        Self {
            columns,
            sources,
            tables: info.tables.clone(),
        }
    }
}

/// Relations visible in one SELECT's FROM clause.
#[derive(Debug, Default)]
struct Scope {
    /// qualifier -> physical table urn
    tables: HashMap<String, String>,
    /// qualifier -> cte name
    cte_aliases: HashMap<String, String>,
    /// qualifier -> derived subquery info
    derived: HashMap<String, VirtualTable>,
    /// cte name -> info, from the enclosing query's WITH clause
    ctes: HashMap<String, VirtualTable>,
    /// FROM-order qualifiers for wildcard expansion
    order: Vec<String>,
}

impl Scope {
    /// The sole relation in FROM, used to attribute bare column names.
    fn only_relation(&self) -> Option<OnlyRelation<'_>> {
        let unique_tables: BTreeSet<&String> = self.tables.values().collect();
        let unique_ctes: BTreeSet<&String> = self.cte_aliases.values().collect();
        match (unique_tables.len(), unique_ctes.len(), self.derived.len()) {
            (1, 0, 0) => unique_tables.into_iter().next().map(OnlyRelation::Table),
            (0, 1, 0) => unique_ctes
                .into_iter()
                .next()
                .and_then(|name| self.ctes.get(name))
                .map(OnlyRelation::Virtual),
            (0, 0, 1) => self.derived.values().next().map(OnlyRelation::Virtual),
            _ => None,
        }
    }

    fn base_tables(&self) -> BTreeSet<String> {
        let mut set: BTreeSet<String> = self.tables.values().cloned().collect();
        for name in self.cte_aliases.values() {
            if let Some(info) = self.ctes.get(name) {
                set.extend(info.tables.iter().cloned());
            }
        }
        for info in self.derived.values() {
            set.extend(info.tables.iter().cloned());
        }
        set
    }
}

enum OnlyRelation<'a> {
    Table(&'a String),
    Virtual(&'a VirtualTable),
}

fn analyze_query(query: &Query, env: &ScriptEnv<'_>) -> Result<SelectInfo> {
    let ctes = build_cte_defs(query, env)?;
    match query.body.as_ref() {
        SetExpr::Select(select) => analyze_select(select, ctes, env),
        SetExpr::Query(inner) => {
            // Nested parenthesized query; CTE scope does not cross here in
            // practice, so analyze the inner query standalone.
            analyze_query(inner, env)
        }
        _ => {
            // UNION/INTERSECT/EXCEPT and friends degrade to table-level.
            let mut info = SelectInfo {
                partial: true,
                ..SelectInfo::default()
            };
            collect_query_tables(query, env, &mut info.tables);
            Ok(info)
        }
    }
}

fn build_cte_defs(query: &Query, env: &ScriptEnv<'_>) -> Result<HashMap<String, VirtualTable>> {
    let mut defs: HashMap<String, VirtualTable> = HashMap::new();
    let Some(with) = &query.with else {
        return Ok(defs);
    };
    for cte in &with.cte_tables {
        let cte_name = ident_to_string(&cte.alias.name);
        let info = match cte.query.body.as_ref() {
            SetExpr::Select(select) => analyze_select(select, defs.clone(), env)?,
            _ => {
                let mut info = SelectInfo {
                    partial: true,
                    ..SelectInfo::default()
                };
                collect_query_tables(&cte.query, env, &mut info.tables);
                info
            }
        };
        let columns: Vec<String> = if !cte.alias.columns.is_empty() {
            cte.alias.columns.iter().map(|c| ident_to_string(&c.name)).collect()
        } else {
            info.columns.clone()
        };
        defs.insert(cte_name, VirtualTable::from_select_info(columns, &info));
    }
    Ok(defs)
}

fn analyze_select(
    select: &Select,
    ctes: HashMap<String, VirtualTable>,
    env: &ScriptEnv<'_>,
) -> Result<SelectInfo> {
    let scope = build_scope(&select.from, ctes, env)?;
    let (expanded, expand_partial) = expand_select_items(select, &scope, env);

    let mut info = SelectInfo {
        columns: expanded.iter().map(|e| e.out_name.clone()).collect(),
        sources: Vec::with_capacity(expanded.len()),
        exprs: Vec::with_capacity(expanded.len()),
        tables: scope.base_tables(),
        partial: expand_partial,
    };

    for exp in &expanded {
        let mut sources = BTreeSet::new();
        if let Some(expr) = exp.expr() {
            collect_expr_columns(expr, &scope, &mut sources);
            if sources.is_empty() && !exp.is_from_wildcard {
                // Bare or computed column with a single source relation:
                // attribute it there even without a registered schema.
                if let Some(OnlyRelation::Table(urn)) = scope.only_relation() {
                    if column_like(expr) {
                        sources.insert(ColumnRef {
                            table: (*urn).clone(),
                            column: expr_column_name(expr),
                        });
                    }
                }
            }
        }
        let transform = exp.expr().and_then(|e| {
            if column_like(e) {
                None
            } else {
                Some(e.to_string())
            }
        });
        info.exprs.push(transform);
        info.sources.push(if sources.is_empty() { None } else { Some(sources) });
    }
    Ok(info)
}

fn build_scope(
    from: &[TableWithJoins],
    ctes: HashMap<String, VirtualTable>,
    env: &ScriptEnv<'_>,
) -> Result<Scope> {
    let mut scope = Scope {
        ctes,
        ..Scope::default()
    };
    for twj in from {
        add_factor_to_scope(&twj.relation, &mut scope, env)?;
        for join in &twj.joins {
            add_factor_to_scope(&join.relation, &mut scope, env)?;
        }
    }
    Ok(scope)
}

fn add_factor_to_scope(factor: &TableFactor, scope: &mut Scope, env: &ScriptEnv<'_>) -> Result<()> {
    match factor {
        TableFactor::Table { name, alias, .. } => {
            let parts = object_name_parts(name);
            let qualifier = alias
                .as_ref()
                .map(|a| ident_to_string(&a.name))
                .or_else(|| parts.last().cloned())
                .unwrap_or_default();
            if parts.len() == 1 && scope.ctes.contains_key(&parts[0]) {
                scope.cte_aliases.insert(qualifier.clone(), parts[0].clone());
                scope.cte_aliases.insert(parts[0].clone(), parts[0].clone());
            } else {
                let urn = env.table_urn(name);
                if alias.is_none() {
                    scope.tables.insert(parts.last().cloned().unwrap_or_default(), urn.clone());
                }
                scope.tables.insert(qualifier.clone(), urn);
            }
            scope.order.push(qualifier);
        }
        TableFactor::Derived {
            subquery,
            alias: Some(alias),
            ..
        } => {
            let inner = analyze_query(subquery, env)?;
            let columns: Vec<String> = if !alias.columns.is_empty() {
                alias.columns.iter().map(|c| ident_to_string(&c.name)).collect()
            } else {
                inner.columns.clone()
            };
            let qualifier = ident_to_string(&alias.name);
            scope
                .derived
                .insert(qualifier.clone(), VirtualTable::from_select_info(columns, &inner));
            scope.order.push(qualifier);
        }
        TableFactor::NestedJoin {
            table_with_joins, ..
        } => {
            add_factor_to_scope(&table_with_joins.relation, scope, env)?;
            for join in &table_with_joins.joins {
                add_factor_to_scope(&join.relation, scope, env)?;
            }
        }
        _ => {}
    }
    Ok(())
}

#[derive(Debug, Clone)]
struct ExpandedItem {
    item: SelectItem,
    out_name: String,
    is_from_wildcard: bool,
}

impl ExpandedItem {
    fn expr(&self) -> Option<&Expr> {
        match &self.item {
            SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } => Some(expr),
            _ => None,
        }
    }
}

/// Expands `*` and `alias.*` into per-column items using registered schemas
/// or CTE/derived shapes. An unexpandable wildcard is skipped and marks the
/// result partial rather than failing the statement.
fn expand_select_items(
    select: &Select,
    scope: &Scope,
    env: &ScriptEnv<'_>,
) -> (Vec<ExpandedItem>, bool) {
    let mut out = Vec::new();
    let mut partial = false;

    let mut push_columns = |out: &mut Vec<ExpandedItem>, qualifier: &str, columns: &[String]| {
        for col in columns {
            let expr = Expr::CompoundIdentifier(vec![
                Ident::new(qualifier.to_string()),
                Ident::new(col.clone()),
            ]);
            out.push(ExpandedItem {
                item: SelectItem::UnnamedExpr(expr),
                out_name: col.clone(),
                is_from_wildcard: true,
            });
        }
    };

    let columns_of = |qualifier: &str| -> Option<Vec<String>> {
        if let Some(urn) = scope.tables.get(qualifier) {
            return env.schema_of(urn);
        }
        if let Some(name) = scope.cte_aliases.get(qualifier) {
            return scope.ctes.get(name).map(|info| info.columns.clone());
        }
        scope.derived.get(qualifier).map(|info| info.columns.clone())
    };

    for item in &select.projection {
        match item {
            SelectItem::Wildcard(_) => {
                for qualifier in &scope.order {
                    match columns_of(qualifier) {
                        Some(cols) => push_columns(&mut out, qualifier, &cols),
                        None => partial = true,
                    }
                }
            }
            SelectItem::QualifiedWildcard(kind, _) => {
                let qualifier = match kind {
                    ast::SelectItemQualifiedWildcardKind::ObjectName(obj) => {
                        object_name_leaf(obj)
                    }
                    _ => {
                        partial = true;
                        continue;
                    }
                };
                match columns_of(&qualifier) {
                    Some(cols) => push_columns(&mut out, &qualifier, &cols),
                    None => partial = true,
                }
            }
            SelectItem::ExprWithAlias { alias, .. } => out.push(ExpandedItem {
                item: item.clone(),
                out_name: ident_to_string(alias),
                is_from_wildcard: false,
            }),
            SelectItem::UnnamedExpr(expr) => out.push(ExpandedItem {
                item: item.clone(),
                out_name: expr_column_name(expr),
                is_from_wildcard: false,
            }),
        }
    }
    (out, partial)
}

/// Output name for an unaliased projection expression.
fn expr_column_name(expr: &Expr) -> String {
    match expr {
        Expr::Identifier(ident) => ident_to_string(ident),
        Expr::CompoundIdentifier(idents) => idents
            .last()
            .map(ident_to_string)
            .unwrap_or_else(|| expr.to_string()),
        _ => expr.to_string(),
    }
}

/// Whether the expression is a plain column reference (no transform).
fn column_like(expr: &Expr) -> bool {
    matches!(expr, Expr::Identifier(_) | Expr::CompoundIdentifier(_))
}

/// Walks an expression collecting base column references, resolving
/// qualifiers through physical tables, CTEs and derived subqueries.
fn collect_expr_columns(expr: &Expr, scope: &Scope, acc: &mut BTreeSet<ColumnRef>) {
    match expr {
        Expr::Identifier(ident) => {
            let column = ident_to_string(ident);
            match scope.only_relation() {
                Some(OnlyRelation::Table(urn)) => {
                    acc.insert(ColumnRef {
                        table: urn.clone(),
                        column,
                    });
                }
                Some(OnlyRelation::Virtual(info)) => {
                    if let Some(srcs) = info.sources.get(&column) {
                        acc.extend(srcs.iter().cloned());
                    }
                }
                None => {}
            }
        }
        Expr::CompoundIdentifier(idents) if idents.len() >= 2 => {
            let qualifier = ident_to_string(&idents[idents.len() - 2]);
            let column = ident_to_string(&idents[idents.len() - 1]);
            if let Some(urn) = scope.tables.get(&qualifier) {
                acc.insert(ColumnRef {
                    table: urn.clone(),
                    column,
                });
            } else if let Some(name) = scope.cte_aliases.get(&qualifier) {
                if let Some(info) = scope.ctes.get(name) {
                    if let Some(srcs) = info.sources.get(&column) {
                        acc.extend(srcs.iter().cloned());
                    }
                }
            } else if let Some(info) = scope.derived.get(&qualifier) {
                if let Some(srcs) = info.sources.get(&column) {
                    acc.extend(srcs.iter().cloned());
                }
            }
        }
        Expr::BinaryOp { left, right, .. } => {
            collect_expr_columns(left, scope, acc);
            collect_expr_columns(right, scope, acc);
        }
        Expr::UnaryOp { expr, .. } | Expr::Nested(expr) | Expr::Cast { expr, .. } => {
            collect_expr_columns(expr, scope, acc)
        }
        Expr::Function(fun) => {
            if let ast::FunctionArguments::List(list) = &fun.args {
                for arg in &list.args {
                    let inner = match arg {
                        ast::FunctionArg::Unnamed(inner) => inner,
                        ast::FunctionArg::Named { arg, .. }
                        | ast::FunctionArg::ExprNamed { arg, .. } => arg,
                    };
                    if let ast::FunctionArgExpr::Expr(e) = inner {
                        collect_expr_columns(e, scope, acc);
                    }
                }
            }
            if let Some(filter) = &fun.filter {
                collect_expr_columns(filter, scope, acc);
            }
            if let Some(ast::WindowType::WindowSpec(spec)) = &fun.over {
                for e in &spec.partition_by {
                    collect_expr_columns(e, scope, acc);
                }
                for ob in &spec.order_by {
                    collect_expr_columns(&ob.expr, scope, acc);
                }
            }
            for ob in &fun.within_group {
                collect_expr_columns(&ob.expr, scope, acc);
            }
        }
        Expr::Case {
            operand,
            conditions,
            else_result,
            ..
        } => {
            if let Some(op) = operand {
                collect_expr_columns(op, scope, acc);
            }
            for when in conditions {
                collect_expr_columns(&when.condition, scope, acc);
                collect_expr_columns(&when.result, scope, acc);
            }
            if let Some(e) = else_result {
                collect_expr_columns(e, scope, acc);
            }
        }
        Expr::Like { expr, pattern, .. } | Expr::ILike { expr, pattern, .. } => {
            collect_expr_columns(expr, scope, acc);
            collect_expr_columns(pattern, scope, acc);
        }
        Expr::Between {
            expr, low, high, ..
        } => {
            collect_expr_columns(expr, scope, acc);
            collect_expr_columns(low, scope, acc);
            collect_expr_columns(high, scope, acc);
        }
        Expr::InList { expr, list, .. } => {
            collect_expr_columns(expr, scope, acc);
            for e in list {
                collect_expr_columns(e, scope, acc);
            }
        }
        Expr::InSubquery { expr, .. } => collect_expr_columns(expr, scope, acc),
        _ => {}
    }
}

fn table_factor_urn(factor: &TableFactor, env: &ScriptEnv<'_>) -> Option<String> {
    match factor {
        TableFactor::Table { name, .. } => Some(env.table_urn(name)),
        _ => None,
    }
}

/// Best-effort table collection over an arbitrary query shape (set
/// operations, nested queries). CTE names defined in the query's own WITH
/// clause are excluded.
fn collect_query_tables(query: &Query, env: &ScriptEnv<'_>, acc: &mut BTreeSet<String>) {
    let mut cte_names = BTreeSet::new();
    if let Some(with) = &query.with {
        for cte in &with.cte_tables {
            cte_names.insert(ident_to_string(&cte.alias.name));
            collect_query_tables(&cte.query, env, acc);
        }
    }
    collect_setexpr_tables(query.body.as_ref(), &cte_names, env, acc);
}

fn collect_setexpr_tables(
    body: &SetExpr,
    cte_names: &BTreeSet<String>,
    env: &ScriptEnv<'_>,
    acc: &mut BTreeSet<String>,
) {
    match body {
        SetExpr::Select(select) => {
            for twj in &select.from {
                collect_twj_tables(twj, cte_names, env, acc);
            }
        }
        SetExpr::Query(inner) => collect_query_tables(inner, env, acc),
        SetExpr::SetOperation { left, right, .. } => {
            collect_setexpr_tables(left, cte_names, env, acc);
            collect_setexpr_tables(right, cte_names, env, acc);
        }
        _ => {}
    }
}

fn collect_twj_tables(
    twj: &TableWithJoins,
    cte_names: &BTreeSet<String>,
    env: &ScriptEnv<'_>,
    acc: &mut BTreeSet<String>,
) {
    collect_factor_tables_inner(&twj.relation, cte_names, env, acc);
    for join in &twj.joins {
        collect_factor_tables_inner(&join.relation, cte_names, env, acc);
    }
}

fn collect_factor_tables_inner(
    factor: &TableFactor,
    cte_names: &BTreeSet<String>,
    env: &ScriptEnv<'_>,
    acc: &mut BTreeSet<String>,
) {
    match factor {
        TableFactor::Table { name, .. } => {
            let parts = object_name_parts(name);
            if parts.len() == 1 && cte_names.contains(&parts[0]) {
                return;
            }
            acc.insert(env.table_urn(name));
        }
        TableFactor::Derived { subquery, .. } => collect_query_tables(subquery, env, acc),
        TableFactor::NestedJoin {
            table_with_joins, ..
        } => collect_twj_tables(table_with_joins, cte_names, env, acc),
        _ => {}
    }
}

fn collect_factor_tables(factor: &TableFactor, env: &ScriptEnv<'_>, acc: &mut BTreeSet<String>) {
    collect_factor_tables_inner(factor, &BTreeSet::new(), env, acc)
}
