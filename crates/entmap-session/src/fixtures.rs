//! Shared domain, mapping and connection double for the crate's unit tests.

use crate::{Entity, EntityBuilder};
use entmap_core::{Connection, Error, Mapping, Result, Row, Value, ValueKind};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

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
    pub started_at: Option<String>,
    pub active: bool,
}

impl Subscription {
    pub fn new(active: bool) -> Self {
        Self {
            started_at: None,
            active,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct Invoice {
    pub amount: f64,
    pub created_at: Option<String>,
}

impl Invoice {
    pub fn new(amount: f64) -> Self {
        Self {
            amount,
            created_at: None,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct LineItem {
    pub price: f64,
    pub quantity: i64,
}

impl LineItem {
    pub fn new(price: f64, quantity: i64) -> Self {
        Self { price, quantity }
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct Group {
    pub name: String,
}

impl Group {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
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
        })
        .unwrap()
        .entity::<Invoice>(|e| {
            e.field("amount", |i: &Invoice| i.amount, |i: &mut Invoice, v| i.amount = v)
                .field(
                    "created_at",
                    |i: &Invoice| i.created_at.clone(),
                    |i: &mut Invoice, v| i.created_at = v,
                )
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
                .kind("price", ValueKind::Numeric)
        })
        .unwrap()
        .entity::<Subscription>(|e| {
            e.field(
                "started_at",
                |s: &Subscription| s.started_at.clone(),
                |s: &mut Subscription, v| s.started_at = v,
            )
            .field(
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
                .presence("name")
        })
        .unwrap()
        .build()
        .unwrap()
}

pub fn shared_mapping() -> Arc<Mapping> {
    Arc::new(mapping())
}

/// Wrap a plain domain object into a new tracked entity.
pub fn entity<T: Send + 'static>(value: T) -> Entity {
    EntityBuilder::new(shared_mapping()).wrap(value).unwrap()
}

/// Build a row from `(column, value)` pairs.
pub fn row(pairs: &[(&str, Value)]) -> Row {
    Row::from_pairs(pairs.iter().map(|(k, v)| (*k, v.clone())))
}

#[derive(Debug, Default)]
pub struct MockState {
    pub statements: Vec<(String, Vec<Value>)>,
    pub results: VecDeque<Vec<Row>>,
    pub next_id: i64,
    pub fail_on: Option<String>,
}

/// Connection double recording every statement and handing out ids.
#[derive(Debug, Clone, Default)]
pub struct MockConnection {
    pub state: Arc<Mutex<MockState>>,
}

impl MockConnection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the rows returned by the next `query` call.
    pub fn push_result(&self, rows: Vec<Row>) {
        self.state.lock().unwrap().results.push_back(rows);
    }

    /// Fail every statement containing `fragment`.
    pub fn fail_on(&self, fragment: &str) {
        self.state.lock().unwrap().fail_on = Some(fragment.to_string());
    }

    /// Stop failing statements.
    pub fn clear_failure(&self) {
        self.state.lock().unwrap().fail_on = None;
    }

    pub fn statements(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .statements
            .iter()
            .map(|(sql, _)| sql.clone())
            .collect()
    }

    pub fn params(&self) -> Vec<Vec<Value>> {
        self.state
            .lock()
            .unwrap()
            .statements
            .iter()
            .map(|(_, params)| params.clone())
            .collect()
    }

    fn record(&self, sql: &str, params: &[Value]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.statements.push((sql.to_string(), params.to_vec()));
        match &state.fail_on {
            Some(fragment) if sql.contains(fragment.as_str()) => {
                Err(Error::Custom(format!("failed: {sql}")))
            }
            _ => Ok(()),
        }
    }
}

impl Connection for MockConnection {
    fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.record(sql, params)?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .results
            .pop_front()
            .unwrap_or_default())
    }

    fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.record(sql, params)?;
        Ok(1)
    }

    fn insert(&self, sql: &str, params: &[Value]) -> Result<i64> {
        self.record(sql, params)?;
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        Ok(state.next_id)
    }
}
