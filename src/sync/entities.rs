//! Entity table
//!
//! The fixed set of upstream entity kinds, with the priority that orders them
//! within a run, the candidate endpoints tried in turn, the entities they
//! reference and any per-entity pagination ceilings.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use crate::sync::pagination::PageLimits;

/// Upstream entity kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntityKind {
    Companies,
    Customers,
    CostCenters,
    Indexers,
    FinancialPlans,
    ReceivableCarriers,
    Enterprises,
    Projects,
    SalesContracts,
    Units,
    Income,
    AccountsReceivable,
    AccountsPayable,
    SalesCommissions,
}

/// Static description of one entity kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityDef {
    pub kind: EntityKind,
    /// Lower runs first
    pub priority: u32,
    /// Tried in order until one succeeds
    pub endpoints: &'static [&'static str],
    /// Entities whose records this one references
    pub dependencies: &'static [EntityKind],
    pub max_pages: Option<usize>,
    pub max_records: Option<usize>,
    pub timeout: Option<Duration>,
}

const TEN_MINUTES: Duration = Duration::from_secs(10 * 60);
const FIFTEEN_MINUTES: Duration = Duration::from_secs(15 * 60);

/// Catalog-style entity: few records, generous page cap
const fn catalog(
    kind: EntityKind,
    priority: u32,
    endpoints: &'static [&'static str],
    dependencies: &'static [EntityKind],
) -> EntityDef {
    EntityDef {
        kind,
        priority,
        endpoints,
        dependencies,
        max_pages: Some(50),
        max_records: Some(2_000),
        timeout: Some(TEN_MINUTES),
    }
}

const fn financial(
    kind: EntityKind,
    priority: u32,
    endpoints: &'static [&'static str],
    dependencies: &'static [EntityKind],
) -> EntityDef {
    EntityDef {
        kind,
        priority,
        endpoints,
        dependencies,
        max_pages: Some(100),
        max_records: Some(20_000),
        timeout: Some(FIFTEEN_MINUTES),
    }
}

use EntityKind::*;

static ENTITIES: [EntityDef; 14] = [
    catalog(Companies, 10, &["/companies"], &[]),
    EntityDef {
        kind: Customers,
        priority: 20,
        endpoints: &["/customers"],
        dependencies: &[],
        max_pages: None,
        max_records: None,
        timeout: None,
    },
    catalog(CostCenters, 30, &["/cost-centers", "/departments"], &[]),
    catalog(Indexers, 40, &["/indexers"], &[]),
    catalog(FinancialPlans, 50, &["/payment-categories"], &[]),
    catalog(ReceivableCarriers, 60, &["/carriers"], &[]),
    catalog(Enterprises, 100, &["/enterprises"], &[Companies]),
    catalog(
        Projects,
        110,
        &["/buildings", "/constructions", "/projects"],
        &[Companies],
    ),
    EntityDef {
        kind: SalesContracts,
        priority: 200,
        endpoints: &["/sales-contracts", "/contracts"],
        dependencies: &[Enterprises, Companies, Customers],
        max_pages: Some(100),
        max_records: Some(5_000),
        timeout: Some(TEN_MINUTES),
    },
    catalog(Units, 210, &["/units"], &[Enterprises, SalesContracts]),
    catalog(Income, 220, &["/income"], &[Customers, Companies, SalesContracts]),
    financial(
        AccountsReceivable,
        230,
        &["/accounts-receivable"],
        &[Customers, Companies, SalesContracts],
    ),
    financial(AccountsPayable, 240, &["/accounts-payable"], &[Companies]),
    catalog(SalesCommissions, 300, &["/commissions"], &[SalesContracts]),
];

impl EntityKind {
    pub const ALL: [EntityKind; 14] = [
        Companies,
        Customers,
        CostCenters,
        Indexers,
        FinancialPlans,
        ReceivableCarriers,
        Enterprises,
        Projects,
        SalesContracts,
        Units,
        Income,
        AccountsReceivable,
        AccountsPayable,
        SalesCommissions,
    ];

    /// Canonical kebab-case identifier
    pub fn id(self) -> &'static str {
        match self {
            Companies => "companies",
            Customers => "customers",
            CostCenters => "cost-centers",
            Indexers => "indexers",
            FinancialPlans => "financial-plans",
            ReceivableCarriers => "receivable-carriers",
            Enterprises => "enterprises",
            Projects => "projects",
            SalesContracts => "sales-contracts",
            Units => "units",
            Income => "income",
            AccountsReceivable => "accounts-receivable",
            AccountsPayable => "accounts-payable",
            SalesCommissions => "sales-commissions",
        }
    }

    /// Parse an identifier in kebab, snake or camel case
    pub fn parse(name: &str) -> Option<Self> {
        let normalized = normalize(name);
        match normalized.as_str() {
            "receivables" => return Some(AccountsReceivable),
            "payables" => return Some(AccountsPayable),
            _ => {}
        }
        Self::ALL.into_iter().find(|kind| kind.id() == normalized)
    }

    pub fn def(self) -> &'static EntityDef {
        // The table is declared in enum order
        &ENTITIES[self as usize]
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl EntityDef {
    /// Ceilings for this entity, falling back to `defaults`
    pub fn limits(&self, defaults: PageLimits) -> PageLimits {
        PageLimits {
            page_size: defaults.page_size,
            max_pages: self.max_pages.unwrap_or(defaults.max_pages),
            max_records: self.max_records.unwrap_or(defaults.max_records),
            timeout: self.timeout.unwrap_or(defaults.timeout),
        }
    }
}

/// camelCase and snake_case to kebab-case
fn normalize(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for (i, c) in name.trim().chars().enumerate() {
        if c.is_ascii_uppercase() {
            if i > 0 && !out.ends_with('-') {
                out.push('-');
            }
            out.push(c.to_ascii_lowercase());
        } else if c == '_' {
            out.push('-');
        } else {
            out.push(c);
        }
    }
    out
}

/// A requested entity after lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestedEntity {
    Known(&'static EntityDef),
    Unknown(String),
}

impl RequestedEntity {
    pub fn name(&self) -> &str {
        match self {
            RequestedEntity::Known(def) => def.kind.id(),
            RequestedEntity::Unknown(name) => name,
        }
    }
}

/// Resolve and order a request for execution
///
/// Known entities are sorted by priority. Unknown identifiers follow, in
/// request order. Duplicates are collapsed to their first occurrence.
pub fn plan<S: AsRef<str>>(requested: &[S]) -> Vec<RequestedEntity> {
    let mut known: Vec<&'static EntityDef> = Vec::new();
    let mut unknown: Vec<String> = Vec::new();
    let mut seen_kinds = HashSet::new();
    let mut seen_names = HashSet::new();

    for name in requested {
        let name = name.as_ref().trim();
        match EntityKind::parse(name) {
            Some(kind) => {
                if seen_kinds.insert(kind) {
                    known.push(kind.def());
                }
            }
            None => {
                if seen_names.insert(name.to_string()) {
                    unknown.push(name.to_string());
                }
            }
        }
    }

    known.sort_by_key(|def| def.priority);

    known
        .into_iter()
        .map(RequestedEntity::Known)
        .chain(unknown.into_iter().map(RequestedEntity::Unknown))
        .collect()
}

/// Add the transitive dependencies of every known requested entity
///
/// Unknown identifiers are passed through unchanged.
pub fn with_dependencies<S: AsRef<str>>(requested: &[S]) -> Vec<String> {
    fn visit(kind: EntityKind, out: &mut Vec<String>, seen: &mut HashSet<EntityKind>) {
        if !seen.insert(kind) {
            return;
        }
        for dep in kind.def().dependencies {
            visit(*dep, out, seen);
        }
        out.push(kind.id().to_string());
    }

    let mut out = Vec::new();
    let mut seen = HashSet::new();
    for name in requested {
        match EntityKind::parse(name.as_ref()) {
            Some(kind) => visit(kind, &mut out, &mut seen),
            None => out.push(name.as_ref().to_string()),
        }
    }
    out
}

/// Check the dependency graph for cycles and priority inversions
pub fn validate_no_cycles() -> Result<(), String> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        Visiting,
        Done,
    }

    fn visit(kind: EntityKind, marks: &mut [Mark; 14], path: &mut Vec<EntityKind>) -> Result<(), String> {
        match marks[kind as usize] {
            Mark::Done => return Ok(()),
            Mark::Visiting => {
                path.push(kind);
                let cycle: Vec<&str> = path.iter().map(|k| k.id()).collect();
                return Err(format!("dependency cycle: {}", cycle.join(" -> ")));
            }
            Mark::Unvisited => {}
        }

        marks[kind as usize] = Mark::Visiting;
        path.push(kind);
        for dep in kind.def().dependencies {
            visit(*dep, marks, path)?;
        }
        path.pop();
        marks[kind as usize] = Mark::Done;
        Ok(())
    }

    let mut marks = [Mark::Unvisited; 14];
    for kind in EntityKind::ALL {
        visit(kind, &mut marks, &mut Vec::new())?;

        for dep in kind.def().dependencies {
            if dep.def().priority >= kind.def().priority {
                return Err(format!(
                    "{} depends on {} but does not run after it",
                    kind, dep
                ));
            }
        }
    }
    Ok(())
}
