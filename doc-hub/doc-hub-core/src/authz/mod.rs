//! Authorization engine: point checks, query scoping and ACL hygiene.
//!
//! Deny entries win: a subject is authorized for a right when one of its
//! principals holds an allow entry carrying the right and none of its
//! principals holds a deny entry carrying it. [`build_access_filter`]
//! encodes the same rule as a database filter, so a document rejected by
//! [`has_authorization`] is never selected by the filter.

use crate::acl::{Ace, Right, Rights};
use crate::auth::{Subject, SubjectDirectory, ADMINS_ID, ADMINS_NAME, ROOT_ID, USERS_ID};
use crate::config::StoreConfig;
use crate::db::DbError;
use crate::document::{fields, Document};
use crate::filter::{Filter, UpdateSpec};
use serde_json::Value;
use std::collections::HashMap;


pub fn has_authorization(subject: &Subject, doc: &Document, right: Right) -> bool {
    if subject.is_admin() {
        return true;
    }
    if doc.id() == Some(subject.id.as_str()) && !matches!(right, Right::Delete | Right::FullControl) {
        return true;
    }
    let requested = Rights::of(&[right]);
    let principals = subject.principal_ids();
    let mut granted = false;
    for ace in doc.acl() {
        if !principals.contains(&ace.subject_id) {
            continue;
        }
        if ace.deny {
            if ace.rights.intersects(requested) {
                return false;
            }
        } else if ace.rights.contains_all(requested) {
            granted = true;
        }
    }
    granted
}

/// Filter selecting the documents `subject` holds every bit of `bits` on.
pub fn build_access_filter(subject: &Subject, bits: Rights) -> Filter {
    if subject.is_admin() {
        return Filter::All;
    }
    let principals = subject.principal_ids();
    let by_acl = Filter::and([
        Filter::AclGrants {
            subjects: principals.clone(),
            bits,
        },
        Filter::AclDenies {
            subjects: principals,
            bits,
        }
        .negate(),
    ]);
    if bits.is_set(Right::Delete) {
        by_acl
    } else {
        Filter::Or(vec![by_acl, Filter::id(subject.id.clone())])
    }
}

pub fn access_filter_for(subject: &Subject, right: Right) -> Filter {
    build_access_filter(subject, Rights::of(&[right]))
}

/// Deduplicate, resolve names, guarantee the actor's own access, add the
/// administrators entry and cap the list. Applying it twice yields the
/// same ACL as applying it once. `directory = None` skips name lookups.
///
/// Access is checked after names are resolved, and the cap never drops an
/// allow entry through which the actor reads or updates the document.
pub async fn normalize_acl(
    doc: &mut Document,
    actor: &Subject,
    config: &StoreConfig,
    directory: Option<&dyn SubjectDirectory>,
) -> Result<(), DbError> {
    let mut acl = dedupe(doc.acl(), config.allow_merge_acl);
    acl.retain(|ace| !ace.rights.is_none());

    if let Some(directory) = directory {
        acl = resolve_names(acl, doc.id(), actor, directory).await?;
    }

    doc.set_acl(&acl);
    if !actor.is_root()
        && !(has_authorization(actor, doc, Right::Read) && has_authorization(actor, doc, Right::Update))
    {
        grant_actor(&mut acl, actor);
    }

    if acl.is_empty() || config.force_add_admins {
        upsert_allow(&mut acl, ADMINS_ID, ADMINS_NAME, Rights::FULL_CONTROL);
    }

    truncate(&mut acl, actor, config.max_ace_count);
    doc.set_acl(&acl);
    Ok(())
}

fn dedupe(acl: Vec<Ace>, merge: bool) -> Vec<Ace> {
    let mut out: Vec<Ace> = Vec::with_capacity(acl.len());
    for ace in acl {
        match out.iter_mut().find(|a| a.same_key(&ace)) {
            Some(existing) if merge => {
                if let Some(merged) = Ace::merge(existing, &ace) {
                    *existing = merged;
                }
            }
            Some(_) => {}
            None => out.push(ace),
        }
    }
    out
}

async fn resolve_names(
    acl: Vec<Ace>,
    doc_id: Option<&str>,
    actor: &Subject,
    directory: &dyn SubjectDirectory,
) -> Result<Vec<Ace>, DbError> {
    let mut names: HashMap<String, Option<String>> = HashMap::new();
    let mut out = Vec::with_capacity(acl.len());
    for mut ace in acl {
        let id = ace.subject_id.as_str();
        if [ROOT_ID, ADMINS_ID, USERS_ID].contains(&id) {
            out.push(ace);
            continue;
        }
        let always_kept = actor.id == id || doc_id == Some(id);
        if !names.contains_key(id) {
            let found = directory.lookup(id).await?.map(|r| r.name);
            names.insert(id.to_string(), found);
        }
        match names.get(id).cloned().flatten() {
            Some(name) => {
                if !name.is_empty() {
                    ace.name = name;
                }
                out.push(ace);
            }
            None if always_kept => out.push(ace),
            None => {
                tracing::debug!(subject = %ace.subject_id, "dropping ACE for unknown subject");
            }
        }
    }
    Ok(out)
}

fn grant_actor(acl: &mut Vec<Ace>, actor: &Subject) {
    if let Some(pos) = acl
        .iter()
        .position(|a| a.deny && a.subject_id == actor.id)
    {
        let mut rights = acl[pos].rights;
        rights.unset(Right::Read);
        rights.unset(Right::Update);
        if rights.is_none() {
            acl.remove(pos);
        } else {
            acl[pos].rights = rights;
        }
    }
    upsert_allow(acl, &actor.id, &actor.name, Rights::FULL_CONTROL);
}

fn upsert_allow(acl: &mut Vec<Ace>, id: &str, name: &str, rights: Rights) {
    let wanted = Ace::allow(id, name, rights);
    match acl.iter_mut().find(|a| a.same_key(&wanted)) {
        Some(existing) => existing.rights = existing.rights.union(rights),
        None => acl.push(wanted),
    }
}

fn truncate(acl: &mut Vec<Ace>, actor: &Subject, max: usize) {
    if acl.len() <= max {
        return;
    }
    let principals = actor.principal_ids();
    let reach = Rights::of(&[Right::Read, Right::Update]);
    let is_protected = |a: &Ace| {
        !a.deny
            && (a.subject_id == ADMINS_ID
                || a.subject_id == actor.id
                || (principals.contains(&a.subject_id) && a.rights.intersects(reach)))
    };
    let protected = acl.iter().filter(|a| is_protected(a)).count();
    let floor = usize::from(protected == 0);
    let mut room = max.saturating_sub(protected).max(floor);
    acl.retain(|a| {
        if is_protected(a) {
            return true;
        }
        if room == 0 {
            return false;
        }
        room -= 1;
        true
    });
}

/// Lower-case `_type`, keep the ACL non-empty and maintain the search
/// names used by text-indexed collections.
pub fn ensure_resource(doc: &mut Document, config: &StoreConfig, text_indexed: bool) {
    let doc_type = doc
        .doc_type()
        .map(str::to_lowercase)
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| "unknown".to_string());
    doc.insert(fields::TYPE.to_string(), Value::String(doc_type));

    let mut acl = doc.acl();
    if acl.is_empty() {
        acl.push(Ace::allow(ADMINS_ID, ADMINS_NAME, Rights::FULL_CONTROL));
        doc.set_acl(&acl);
    }

    if text_indexed {
        let mut names: Vec<String> = Vec::new();
        let mut primary: Option<String> = None;
        for field in &config.text_index_name_fields {
            let Some(value) = doc.str_field(field) else { continue };
            let lowered = value.to_lowercase();
            primary.get_or_insert_with(|| lowered.clone());
            let words = std::iter::once(lowered.clone())
                .chain(lowered.split_whitespace().map(str::to_string));
            for word in words {
                if !word.is_empty() && !names.contains(&word) {
                    names.push(word);
                }
            }
        }
        if let Some(primary) = primary {
            doc.insert(fields::SEARCH_NAME.to_string(), Value::String(primary));
            doc.insert(
                fields::SEARCH_NAMES.to_string(),
                Value::Array(names.into_iter().map(Value::String).collect()),
            );
        }
    }
}

/// Non-administrators cannot change protected fields through a replace:
/// the original values are put back.
pub fn restore_protected_fields(
    doc: &mut Document,
    original: &Document,
    actor: &Subject,
    config: &StoreConfig,
) {
    if actor.is_admin() {
        return;
    }
    for field in &config.protected_fields {
        match original.get(field) {
            Some(value) => {
                doc.insert(field.clone(), value.clone());
            }
            None => {
                doc.remove(field);
            }
        }
    }
}

/// Operator updates never write protected fields, whoever the caller is.
pub fn strip_protected_operators(spec: &mut UpdateSpec, config: &StoreConfig) {
    for field in &config.protected_fields {
        spec.strip(field);
    }
}

/// Remove fields hidden from non-administrators.
pub fn redact(doc: &mut Document, subject: &Subject, config: &StoreConfig) {
    if subject.is_admin() {
        return;
    }
    for field in &config.redacted_fields {
        doc.remove(field);
    }
}
