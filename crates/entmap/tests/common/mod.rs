//! Shared domain and an in-memory connection for the scenario tests.
//!
//! `MemoryConnection` keeps tables as lists of column maps. It understands
//! the INSERT/UPDATE/DELETE statements a flush renders, snapshots on BEGIN
//! so ROLLBACK restores the previous state, and answers single-table
//! SELECTs of the form `SELECT a.x AS e__x, .. FROM t a [WHERE a.c = $1]`.
//! Anything else is answered from a queue of scripted results.

#![allow(dead_code)]

use entmap::{Connection, Error, Mapping, Result, Row, Value, ValueKind};
use regex::Regex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Default, Clone, PartialEq)]
pub struct Plan {
    pub name: String,
    pub price: f64,
}

impl Plan {
    pub fn new(name: &str, price: f64) -> Self {
        Self {
            name: name.to_string(),
            price,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct Customer {
    pub first_name: String,
    pub last_name: String,
}

impl Customer {
    pub fn new(first_name: &str, last_name: &str) -> Self {
        Self {
            first_name: first_name.to_string(),
            last_name: last_name.to_string(),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct Subscription {
    pub active: bool,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct Invoice {
    pub amount: f64,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct LineItem {
    pub price: f64,
    pub quantity: i64,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct Group {
    pub name: String,
}

pub fn mapping() -> Mapping {
    Mapping::builder()
        .entity::<Customer>(|e| {
            e.field(
                "first_name",
                |c: &Customer| c.first_name.clone(),
                |c: &mut Customer, v| c.first_name = v,
            )
            .field(
                "last_name",
                |c: &Customer| c.last_name.clone(),
                |c: &mut Customer, v| c.last_name = v,
            )
            .collection::<Subscription>("subscriptions")
            .collection::<Invoice>("invoices")
            .collection_via::<Group>("groups", "customer_groups")
            .weak_reference::<Plan>("plan")
            .presence("first_name")
        })
        .unwrap()
        .entity::<Invoice>(|e| {
            e.field("amount", |i: &Invoice| i.amount, |i: &mut Invoice, v| i.amount = v)
                .collection::<LineItem>("line_items")
                .reference::<Subscription>("subscription")
        })
        .unwrap()
        .entity::<LineItem>(|e| {
            e.field("price", |l: &LineItem| l.price, |l: &mut LineItem, v| l.price = v)
                .field(
                    "quantity",
                    |l: &LineItem| l.quantity,
                    |l: &mut LineItem, v| l.quantity = v,
                )
                .reference::<Invoice>("invoice")
        })
        .unwrap()
        .entity::<Plan>(|e| {
            e.field("name", |p: &Plan| p.name.clone(), |p: &mut Plan, v| p.name = v)
                .field("price", |p: &Plan| p.price, |p: &mut Plan, v| p.price = v)
                .presence("name")
                .kind("price", ValueKind::Numeric)
        })
        .unwrap()
        .entity::<Subscription>(|e| {
            e.field(
                "active",
                |s: &Subscription| s.active,
                |s: &mut Subscription, v| s.active = v,
            )
            .reference::<Customer>("customer")
            .reference::<Plan>("plan")
        })
        .unwrap()
        .entity::<Group>(|e| {
            e.field("name", |g: &Group| g.name.clone(), |g: &mut Group, v| g.name = v)
                .collection_via::<Customer>("customers", "customer_groups")
        })
        .unwrap()
        .build()
        .unwrap()
}

pub type Table = Vec<BTreeMap<String, Value>>;

#[derive(Debug, Default)]
struct Store {
    tables: HashMap<String, Table>,
    next_ids: HashMap<String, i64>,
    snapshot: Option<(HashMap<String, Table>, HashMap<String, i64>)>,
    statements: Vec<String>,
    scripted: VecDeque<Vec<Row>>,
    fail_on: Option<String>,
}

/// In-memory stand-in for a database connection.
#[derive(Debug, Clone, Default)]
pub struct MemoryConnection {
    store: Arc<Mutex<Store>>,
}

impl MemoryConnection {
    pub fn new() -> Self {
        Self::default()
    }

    fn store(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap()
    }

    /// Answer the next query that cannot be evaluated with `rows`.
    pub fn script(&self, rows: Vec<Row>) {
        self.store().scripted.push_back(rows);
    }

    /// Fail every statement containing `fragment`.
    pub fn fail_on(&self, fragment: &str) {
        self.store().fail_on = Some(fragment.to_string());
    }

    pub fn clear_failure(&self) {
        self.store().fail_on = None;
    }

    pub fn statements(&self) -> Vec<String> {
        self.store().statements.clone()
    }

    pub fn clear_statements(&self) {
        self.store().statements.clear();
    }

    /// Current rows of a table, in insertion order.
    pub fn table(&self, name: &str) -> Table {
        self.store().tables.get(name).cloned().unwrap_or_default()
    }

    /// Seed a row directly, bypassing any statement.
    pub fn seed(&self, table: &str, row: &[(&str, Value)]) {
        let mut store = self.store();
        let row: BTreeMap<String, Value> =
            row.iter().map(|(k, v)| ((*k).to_string(), v.clone())).collect();
        if let Some(id) = row.get("id").and_then(Value::as_i64) {
            let next = store.next_ids.entry(table.to_string()).or_insert(0);
            *next = (*next).max(id);
        }
        store.tables.entry(table.to_string()).or_default().push(row);
    }

    fn record(&self, sql: &str) -> Result<()> {
        let mut store = self.store();
        store.statements.push(sql.to_string());
        match &store.fail_on {
            Some(fragment) if sql.contains(fragment.as_str()) => {
                Err(Error::Custom(format!("statement failed: {sql}")))
            }
            _ => Ok(()),
        }
    }
}

fn unquote(ident: &str) -> String {
    ident.trim().trim_matches('"').to_string()
}

fn assignments(list: &str, separator: &str) -> Vec<String> {
    list.split(separator)
        .filter_map(|part| part.split_once(" = ").map(|(col, _)| unquote(col)))
        .collect()
}

impl Connection for MemoryConnection {
    fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.record(sql)?;
        let mut store = self.store();
        if let Some(rows) = store.scripted.pop_front() {
            return Ok(rows);
        }

        let select = Regex::new(
            r"^SELECT (.+) FROM (\w+) (\w+)(?: WHERE (\w+)\.(\w+) = \$1)?(?: LIMIT \d+)?$",
        )
        .unwrap();
        let column = Regex::new(r"^(\w+)\.(\w+)(?: AS (\w+))?$").unwrap();
        let Some(caps) = select.captures(sql.trim()) else {
            return Ok(Vec::new());
        };
        let table = store.tables.get(&caps[2]).cloned().unwrap_or_default();
        let filter = caps.get(5).map(|c| c.as_str().to_string());

        let mut rows = Vec::new();
        for stored in table {
            if let Some(field) = &filter {
                if stored.get(field) != params.first() {
                    continue;
                }
            }
            let mut pairs = Vec::new();
            for item in caps[1].split(", ") {
                let Some(col) = column.captures(item.trim()) else {
                    continue;
                };
                let key = col.get(3).map_or(&col[2], |alias| alias.as_str()).to_string();
                pairs.push((key, stored.get(&col[2]).cloned().unwrap_or(Value::Null)));
            }
            rows.push(Row::from_pairs(pairs));
        }
        Ok(rows)
    }

    fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.record(sql)?;
        let mut store = self.store();
        match sql {
            "BEGIN" => {
                store.snapshot = Some((store.tables.clone(), store.next_ids.clone()));
                return Ok(0);
            }
            "COMMIT" => {
                store.snapshot = None;
                return Ok(0);
            }
            "ROLLBACK" => {
                if let Some((tables, next_ids)) = store.snapshot.take() {
                    store.tables = tables;
                    store.next_ids = next_ids;
                }
                return Ok(0);
            }
            _ => {}
        }

        if let Some(rest) = sql.strip_prefix("INSERT INTO ") {
            let (table, row) = parse_insert(rest, params);
            store.tables.entry(table).or_default().push(row);
            return Ok(1);
        }
        if let Some(rest) = sql.strip_prefix("UPDATE ") {
            let (table, rest) = rest.split_once(" SET ").unwrap();
            let (sets, _) = rest.split_once(" WHERE ").unwrap();
            let columns = assignments(sets, ", ");
            let id = params.last().cloned().unwrap_or(Value::Null);
            let mut changed = 0;
            for row in store.tables.entry(unquote(table)).or_default() {
                if row.get("id") == Some(&id) {
                    for (col, value) in columns.iter().zip(params) {
                        row.insert(col.clone(), value.clone());
                    }
                    changed += 1;
                }
            }
            return Ok(changed);
        }
        if let Some(rest) = sql.strip_prefix("DELETE FROM ") {
            let (table, conds) = rest.split_once(" WHERE ").unwrap();
            let columns = assignments(conds, " AND ");
            let rows = store.tables.entry(unquote(table)).or_default();
            let before = rows.len();
            rows.retain(|row| {
                !columns
                    .iter()
                    .zip(params)
                    .all(|(col, value)| row.get(col) == Some(value))
            });
            return Ok((before - rows.len()) as u64);
        }
        Ok(0)
    }

    fn insert(&self, sql: &str, params: &[Value]) -> Result<i64> {
        self.record(sql)?;
        let mut store = self.store();
        let rest = sql.strip_prefix("INSERT INTO ").unwrap_or(sql);
        let (table, mut row) = parse_insert(rest, params);
        let next = store.next_ids.entry(table.clone()).or_insert(0);
        *next += 1;
        let id = *next;
        row.insert("id".to_string(), Value::BigInt(id));
        store.tables.entry(table).or_default().push(row);
        Ok(id)
    }
}

fn parse_insert(rest: &str, params: &[Value]) -> (String, BTreeMap<String, Value>) {
    if let Some(table) = rest.strip_suffix(" DEFAULT VALUES") {
        return (unquote(table), BTreeMap::new());
    }
    let (table, rest) = rest.split_once(" (").unwrap();
    let (columns, _) = rest.split_once(") VALUES").unwrap();
    let row = columns
        .split(", ")
        .map(unquote)
        .zip(params.iter().cloned())
        .collect();
    (unquote(table), row)
}

/// Build a row from `(column, value)` pairs.
pub fn row(pairs: &[(&str, Value)]) -> Row {
    Row::from_pairs(pairs.iter().map(|(k, v)| (*k, v.clone())))
}
