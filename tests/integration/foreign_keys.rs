//! Foreign key constraints between an index and a foreign database.
//!
//! Inserting an index key absent from the foreign database fails the
//! primary write; deleting a referenced foreign record aborts, cascades or
//! nullifies according to the index configuration.

#![allow(missing_docs)]

mod common;

use cairn::{
    CairnError, Database, DatabaseConfig, Environment, ForeignKeyDeleteAction, KeyCreator, LockMode,
    Lookup, Nullifier, OperationStatus, Result, SecondaryConfig, SecondaryDatabase, TransactionConfig,
};
use common::{dump, env, index_entries, plain_db, txn_db};

/// The employee record's data is its department id; empty means none.
fn department_of() -> KeyCreator {
    KeyCreator::single(|_, data: &[u8]| (!data.is_empty()).then(|| data.to_vec()))
}

struct Company {
    env: Environment,
    departments: Database,
    employees: Database,
    by_department: SecondaryDatabase,
}

fn company(action: ForeignKeyDeleteAction, nullifier: Option<Nullifier>) -> Result<Company> {
    let env = env();
    let departments = txn_db(&env, "departments", false);
    let employees = txn_db(&env, "employees", false);
    departments.put(None, b"eng", b"Engineering")?;
    departments.put(None, b"ops", b"Operations")?;

    let config = SecondaryConfig {
        database: DatabaseConfig::create()
            .with_duplicates(true)
            .with_transactional(true),
        foreign_key_database: Some(departments.clone()),
        foreign_key_delete_action: action,
        foreign_key_nullifier: nullifier,
        ..SecondaryConfig::new(department_of())
    };
    let by_department = env.open_secondary_database("employees_by_department", &employees, config)?;

    employees.put(None, b"ada", b"eng")?;
    employees.put(None, b"alan", b"eng")?;
    employees.put(None, b"grace", b"ops")?;
    Ok(Company {
        env,
        departments,
        employees,
        by_department,
    })
}

#[test]
fn unknown_foreign_key_fails_the_primary_write() -> Result<()> {
    let c = company(ForeignKeyDeleteAction::Abort, None)?;

    assert!(matches!(
        c.employees.put(None, b"linus", b"kernel"),
        Err(CairnError::ForeignKeyViolation { .. })
    ));
    assert_eq!(c.employees.get(None, b"linus", LockMode::Default)?, Lookup::NotFound);

    // Updating an existing record to an unknown key leaves the old record.
    assert!(matches!(
        c.employees.put(None, b"ada", b"kernel"),
        Err(CairnError::ForeignKeyViolation { .. })
    ));
    assert_eq!(c.employees.get(None, b"ada", LockMode::Default)?.found().unwrap().data, b"eng");
    assert_eq!(c.by_department.count()?, 3);
    Ok(())
}

#[test]
fn referenced_foreign_record_cannot_be_deleted() -> Result<()> {
    let c = company(ForeignKeyDeleteAction::Abort, None)?;

    assert!(matches!(
        c.departments.delete(None, b"eng"),
        Err(CairnError::ForeignKeyDeleteAborted { .. })
    ));
    assert!(c.departments.get(None, b"eng", LockMode::Default)?.is_found());

    // Inside a transaction the failure leaves the transaction to the caller.
    let txn = c.env.begin_transaction(TransactionConfig::default())?;
    assert!(c.departments.delete(Some(&txn), b"ops").is_err());
    txn.abort()?;
    assert!(c.departments.get(None, b"ops", LockMode::Default)?.is_found());

    // Once nothing refers to it, the delete goes through.
    c.employees.delete(None, b"grace")?;
    assert_eq!(c.departments.delete(None, b"ops")?, OperationStatus::Success);
    Ok(())
}

#[test]
fn cascade_deletes_referencing_records() -> Result<()> {
    let c = company(ForeignKeyDeleteAction::Cascade, None)?;

    assert_eq!(c.departments.delete(None, b"eng")?, OperationStatus::Success);
    let left: Vec<_> = dump(&c.employees)?.into_iter().map(|(k, _)| k).collect();
    assert_eq!(left, vec![b"grace".to_vec()]);
    assert_eq!(
        index_entries(&c.by_department)?,
        vec![(b"ops".to_vec(), b"grace".to_vec())]
    );
    Ok(())
}

#[test]
fn cascade_rolls_back_with_the_transaction() -> Result<()> {
    let c = company(ForeignKeyDeleteAction::Cascade, None)?;

    let txn = c.env.begin_transaction(TransactionConfig::default())?;
    c.departments.delete(Some(&txn), b"eng")?;
    assert_eq!(c.employees.count()?, 1);
    txn.abort()?;

    assert_eq!(c.employees.count()?, 3);
    assert_eq!(c.by_department.count()?, 3);
    assert!(c.departments.get(None, b"eng", LockMode::Default)?.is_found());
    Ok(())
}

#[test]
fn nullify_rewrites_referencing_records() -> Result<()> {
    let nullifier = Nullifier::single(|data: &mut Vec<u8>| {
        data.clear();
        true
    });
    let c = company(ForeignKeyDeleteAction::Nullify, Some(nullifier))?;

    assert_eq!(c.departments.delete(None, b"eng")?, OperationStatus::Success);
    assert_eq!(c.employees.count()?, 3);
    assert_eq!(c.employees.get(None, b"ada", LockMode::Default)?.found().unwrap().data, b"");
    assert_eq!(c.employees.get(None, b"alan", LockMode::Default)?.found().unwrap().data, b"");
    assert_eq!(
        index_entries(&c.by_department)?,
        vec![(b"ops".to_vec(), b"grace".to_vec())]
    );
    Ok(())
}

#[test]
fn multi_key_nullifier_sees_the_deleted_key() -> Result<()> {
    let env = env();
    let tags = txn_db(&env, "tags", false);
    let posts = txn_db(&env, "posts", false);
    for tag in [b"x", b"y", b"z"] {
        tags.put(None, tag, b"")?;
    }
    let config = SecondaryConfig {
        database: DatabaseConfig::create()
            .with_duplicates(true)
            .with_transactional(true),
        foreign_key_database: Some(tags.clone()),
        foreign_key_delete_action: ForeignKeyDeleteAction::Nullify,
        foreign_key_nullifier: Some(Nullifier::multi(|_, data: &mut Vec<u8>, key: &[u8]| {
            let before = data.len();
            data.retain(|byte| Some(byte) != key.first());
            data.len() != before
        })),
        ..SecondaryConfig::new(common::every_byte_key())
    };
    let by_tag = env.open_secondary_database("posts_by_tag", &posts, config)?;
    posts.put(None, b"p1", b"xy")?;
    posts.put(None, b"p2", b"yz")?;

    tags.delete(None, b"y")?;
    assert_eq!(posts.get(None, b"p1", LockMode::Default)?.found().unwrap().data, b"x");
    assert_eq!(posts.get(None, b"p2", LockMode::Default)?.found().unwrap().data, b"z");
    assert_eq!(by_tag.count()?, 2);
    Ok(())
}

#[test]
fn foreign_key_settings_are_validated() -> Result<()> {
    let env = env();
    let employees = txn_db(&env, "employees", false);
    let departments = txn_db(&env, "departments", false);

    let missing_nullifier = SecondaryConfig {
        database: DatabaseConfig::create()
            .with_duplicates(true)
            .with_transactional(true),
        foreign_key_database: Some(departments),
        foreign_key_delete_action: ForeignKeyDeleteAction::Nullify,
        ..SecondaryConfig::new(department_of())
    };
    assert!(matches!(
        env.open_secondary_database("no_nullifier", &employees, missing_nullifier),
        Err(CairnError::Config(_))
    ));

    let duplicated = plain_db(&env, "duplicated", true);
    let dup_foreign = SecondaryConfig {
        foreign_key_database: Some(duplicated),
        ..SecondaryConfig::new(department_of())
    };
    assert!(matches!(
        env.open_secondary_database("dup_foreign", &employees, dup_foreign),
        Err(CairnError::Config(_))
    ));
    Ok(())
}
