//! Diff engine: desired state vs. prior observed state.
//!
//! Produces the minimal update payload plus an explicit delete-list. The
//! server keeps any field that is not mentioned in an update, so clearing a
//! field must be requested by name.

use std::collections::BTreeMap;

use crate::field::{DesiredState, Field, Fingerprints, ResourceState, Value, fingerprint};
use crate::schema::ResourceKind;

/// Changes for one write.
///
/// A field never appears in both `updates` and `deletes`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub updates: BTreeMap<String, Value>,
    /// Field names to clear, in schema order.
    pub deletes: Vec<String>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty() && self.deletes.is_empty()
    }

    /// `Present` if updated, `Null` if deleted, `Absent` if untouched.
    pub fn get(&self, name: &str) -> Field<&Value> {
        if let Some(value) = self.updates.get(name) {
            Field::Present(value)
        } else if self.deletes.iter().any(|d| d == name) {
            Field::Null
        } else {
            Field::Absent
        }
    }
}

/// Outcome of comparing desired and prior state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diff {
    Changes(ChangeSet),
    /// Immutable fields differ; the resource must be deleted and recreated.
    RequiresReplacement(Vec<String>),
}

impl Diff {
    pub fn is_noop(&self) -> bool {
        matches!(self, Diff::Changes(cs) if cs.is_empty())
    }
}

/// Desired value of a field, with empty blocks folded into "unset".
fn desired_value<'a>(desired: &'a DesiredState, name: &str) -> Option<&'a Value> {
    match desired.get(name) {
        Field::Present(Value::Block(props)) if props.is_empty() => None,
        Field::Present(value) => Some(value),
        Field::Absent | Field::Null => None,
    }
}

/// Compute the change set that moves `prior` to `desired`.
///
/// With no prior state (create path) the updates are every set field of
/// `desired`. Otherwise each schema field is compared in declaration order:
/// a set field that differs from prior is updated, an unset field whose
/// prior value is non-empty is deleted. Immutable fields never appear in a
/// change set; a differing immutable value yields
/// [`Diff::RequiresReplacement`].
///
/// Write-only fields the server does not report are compared against the
/// fingerprints in `prior.sent`. Without a fingerprint there is nothing to
/// compare against and the field is left alone.
pub fn compute_change_set(
    kind: &ResourceKind,
    desired: &DesiredState,
    prior: Option<&ResourceState>,
) -> Diff {
    let Some(prior) = prior else {
        let updates = kind
            .fields
            .iter()
            .filter_map(|spec| {
                desired_value(desired, spec.name).map(|v| (spec.name.to_string(), v.clone()))
            })
            .collect();
        return Diff::Changes(ChangeSet {
            updates,
            deletes: Vec::new(),
        });
    };

    let replaced: Vec<String> = kind
        .immutable_fields()
        .filter(|spec| {
            // Unknown prior value is not comparable.
            match (desired_value(desired, spec.name), prior.get(spec.name)) {
                (Some(want), Some(have)) => want != have,
                _ => false,
            }
        })
        .map(|spec| spec.name.to_string())
        .collect();
    if !replaced.is_empty() {
        return Diff::RequiresReplacement(replaced);
    }

    let mut changes = ChangeSet::default();
    for spec in kind.fields.iter().filter(|spec| !spec.immutable) {
        let want = desired_value(desired, spec.name);
        let have = prior.get(spec.name);

        if spec.write_only && have.is_none() {
            match (want, prior.sent.get(spec.name)) {
                (Some(value), Some(sent)) if *sent != fingerprint(value) => {
                    changes.updates.insert(spec.name.to_string(), value.clone());
                }
                (None, Some(_)) => changes.deletes.push(spec.name.to_string()),
                _ => {}
            }
            continue;
        }

        match want {
            Some(value) => {
                if have != Some(value) {
                    changes.updates.insert(spec.name.to_string(), value.clone());
                }
            }
            None => {
                if prior.has_value(spec.name) {
                    changes.deletes.push(spec.name.to_string());
                }
            }
        }
    }

    Diff::Changes(changes)
}

/// State the server holds after successfully applying `changes` to `prior`.
pub fn apply_change_set(prior: &ResourceState, changes: &ChangeSet) -> ResourceState {
    let mut next = prior.clone();
    for name in &changes.deletes {
        next.fields.remove(name);
        next.sent.remove(name);
    }
    for (name, value) in &changes.updates {
        next.fields.insert(name.clone(), value.clone());
    }
    next
}

/// Write-only fingerprints once `changes` has been written on top of `sent`.
///
/// Written values are fingerprinted. A desired write-only value with no
/// fingerprint yet is taken as what the server holds, so that a later edit
/// of it is detected.
pub fn sent_after(
    kind: &ResourceKind,
    desired: &DesiredState,
    sent: &Fingerprints,
    changes: &ChangeSet,
) -> Fingerprints {
    let mut next = sent.clone();
    for name in &changes.deletes {
        next.remove(name);
    }
    for spec in kind.fields.iter().filter(|spec| spec.write_only) {
        let value = changes
            .updates
            .get(spec.name)
            .or_else(|| desired_value(desired, spec.name).filter(|_| !next.contains_key(spec.name)));
        if let Some(value) = value {
            next.insert(spec.name.to_string(), fingerprint(value));
        }
    }
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kinds::REMOTE;
    use crate::property::{BlockCodec, PropertyMap, parse_property_string};
    use crate::retry::classify_lock_contention;
    use crate::schema::{FieldSpec, no_validation};

    static FIELDS: &[FieldSpec] = &[
        FieldSpec::text("bucket").immutable(),
        FieldSpec::text("comment"),
        FieldSpec::text("rate"),
        FieldSpec::integer("keep-last"),
        FieldSpec::block("notify", BlockCodec::Notify),
        FieldSpec::text("secret").write_only(),
    ];

    static KIND: ResourceKind = ResourceKind {
        name: "thing",
        collection: "config/thing",
        id_field: "id",
        fields: FIELDS,
        lock_class: None,
        task_backed: false,
        classify: classify_lock_contention,
        validate: no_validation,
    };

    fn changes(diff: Diff) -> ChangeSet {
        match diff {
            Diff::Changes(cs) => cs,
            other => panic!("expected changes, got {:?}", other),
        }
    }

    fn block(raw: &str) -> Value {
        Value::Block(parse_property_string(raw))
    }

    fn assert_disjoint(cs: &ChangeSet) {
        for name in &cs.deletes {
            assert!(!cs.updates.contains_key(name), "{} in both updates and deletes", name);
        }
    }

    // =========================================================================
    // Create path
    // =========================================================================

    #[test]
    fn test_create_sends_every_set_field() {
        let desired = DesiredState::new("r1")
            .set("bucket", Value::text("a"))
            .set("comment", Value::text(""))
            .clear("rate")
            .set("notify", Value::Block(PropertyMap::new()));

        let cs = changes(compute_change_set(&KIND, &desired, None));
        assert_eq!(cs.updates.len(), 2);
        assert_eq!(cs.get("bucket"), Field::Present(&Value::text("a")));
        assert_eq!(cs.get("comment"), Field::Present(&Value::text("")));
        assert_eq!(cs.get("notify"), Field::Absent);
        assert!(cs.deletes.is_empty());
    }

    // =========================================================================
    // Update path
    // =========================================================================

    #[test]
    fn test_update_clears_omitted_field() {
        let prior = ResourceState::new("r1")
            .with("comment", Value::text("old"))
            .with("rate", Value::text("10M"));
        let desired = DesiredState::new("r1").set("rate", Value::text("10M"));

        let cs = changes(compute_change_set(&KIND, &desired, Some(&prior)));
        assert!(cs.updates.is_empty());
        assert_eq!(cs.deletes, vec!["comment".to_string()]);
        assert_eq!(cs.get("comment"), Field::Null);
    }

    #[test]
    fn test_explicit_null_clears_like_omission() {
        let prior = ResourceState::new("r1").with("comment", Value::text("old"));
        let desired = DesiredState::new("r1").clear("comment");

        let cs = changes(compute_change_set(&KIND, &desired, Some(&prior)));
        assert_eq!(cs.deletes, vec!["comment".to_string()]);
    }

    #[test]
    fn test_empty_string_is_a_value() {
        let prior = ResourceState::new("r1").with("comment", Value::text("old"));
        let desired = DesiredState::new("r1").set("comment", Value::text(""));

        let cs = changes(compute_change_set(&KIND, &desired, Some(&prior)));
        assert_eq!(cs.get("comment"), Field::Present(&Value::text("")));
        assert!(cs.deletes.is_empty());
    }

    #[test]
    fn test_zero_is_a_value() {
        let prior = ResourceState::new("r1").with("keep-last", Value::Integer(5));
        let desired = DesiredState::new("r1").set("keep-last", Value::Integer(0));

        let cs = changes(compute_change_set(&KIND, &desired, Some(&prior)));
        assert_eq!(cs.get("keep-last"), Field::Present(&Value::Integer(0)));
    }

    #[test]
    fn test_unset_on_both_sides_is_omitted() {
        let prior = ResourceState::new("r1").with("comment", Value::text(""));
        let desired = DesiredState::new("r1");

        assert!(compute_change_set(&KIND, &desired, Some(&prior)).is_noop());
    }

    #[test]
    fn test_deletes_follow_schema_order() {
        let prior = ResourceState::new("r1")
            .with("notify", block("gc=always"))
            .with("rate", Value::text("1M"))
            .with("comment", Value::text("x"));
        let desired = DesiredState::new("r1");

        let cs = changes(compute_change_set(&KIND, &desired, Some(&prior)));
        assert_eq!(cs.deletes, vec!["comment", "rate", "notify"]);
    }

    #[test]
    fn test_block_removed_wholesale() {
        let prior = ResourceState::new("r1").with("notify", block("gc=always,prune=error"));

        let removed = DesiredState::new("r1");
        let cs = changes(compute_change_set(&KIND, &removed, Some(&prior)));
        assert_eq!(cs.deletes, vec!["notify".to_string()]);

        let emptied = DesiredState::new("r1").set("notify", Value::Block(PropertyMap::new()));
        let cs = changes(compute_change_set(&KIND, &emptied, Some(&prior)));
        assert_eq!(cs.deletes, vec!["notify".to_string()]);
        assert!(cs.updates.is_empty());
    }

    #[test]
    fn test_block_update_carries_only_set_subfields() {
        let prior = ResourceState::new("r1").with("notify", block("gc=always,prune=error"));
        let desired = DesiredState::new("r1").set("notify", block("gc=never"));

        let cs = changes(compute_change_set(&KIND, &desired, Some(&prior)));
        assert_eq!(cs.get("notify"), Field::Present(&block("gc=never")));
    }

    // =========================================================================
    // Immutable fields
    // =========================================================================

    #[test]
    fn test_immutable_change_requires_replacement() {
        let prior = ResourceState::new("r1").with("bucket", Value::text("a"));
        let desired = DesiredState::new("r1")
            .set("bucket", Value::text("b"))
            .set("comment", Value::text("new"));

        assert_eq!(
            compute_change_set(&KIND, &desired, Some(&prior)),
            Diff::RequiresReplacement(vec!["bucket".to_string()])
        );
    }

    #[test]
    fn test_immutable_field_never_updated_or_deleted() {
        let prior = ResourceState::new("r1").with("bucket", Value::text("a"));

        let same = DesiredState::new("r1").set("bucket", Value::text("a"));
        assert!(compute_change_set(&KIND, &same, Some(&prior)).is_noop());

        let omitted = DesiredState::new("r1");
        assert!(compute_change_set(&KIND, &omitted, Some(&prior)).is_noop());

        let unknown_prior = ResourceState::new("r1");
        let set = DesiredState::new("r1").set("bucket", Value::text("b"));
        assert!(compute_change_set(&KIND, &set, Some(&unknown_prior)).is_noop());
    }

    // =========================================================================
    // Write-only fields
    // =========================================================================

    #[test]
    fn test_unreported_secret_without_fingerprint_is_left_alone() {
        let desired = DesiredState::new("offsite")
            .set("host", Value::text("pbs2.example.com"))
            .set("auth-id", Value::text("sync@pbs"))
            .set("password", Value::text("s3cret"));
        let read_back = ResourceState::new("offsite")
            .with("host", Value::text("pbs2.example.com"))
            .with("auth-id", Value::text("sync@pbs"));

        assert!(compute_change_set(&REMOTE, &desired, Some(&read_back)).is_noop());
    }

    #[test]
    fn test_secret_compared_against_sent_fingerprint() {
        let prior = ResourceState::new("r1").with_sent("secret", &Value::text("a"));

        let same = DesiredState::new("r1").set("secret", Value::text("a"));
        assert!(compute_change_set(&KIND, &same, Some(&prior)).is_noop());

        let rotated = DesiredState::new("r1").set("secret", Value::text("b"));
        let cs = changes(compute_change_set(&KIND, &rotated, Some(&prior)));
        assert_eq!(cs.get("secret"), Field::Present(&Value::text("b")));

        let removed = DesiredState::new("r1");
        let cs = changes(compute_change_set(&KIND, &removed, Some(&prior)));
        assert_eq!(cs.deletes, vec!["secret".to_string()]);
    }

    #[test]
    fn test_secret_sent_on_create_then_converges() {
        let desired = DesiredState::new("r1")
            .set("comment", Value::text("x"))
            .set("secret", Value::text("a"));

        let cs = changes(compute_change_set(&KIND, &desired, None));
        assert_eq!(cs.get("secret"), Field::Present(&Value::text("a")));

        // The server keeps the secret but never returns it.
        let mut read_back = ResourceState::new("r1").with("comment", Value::text("x"));
        read_back.sent = sent_after(&KIND, &desired, &Fingerprints::new(), &cs);
        assert!(compute_change_set(&KIND, &desired, Some(&read_back)).is_noop());
    }

    #[test]
    fn test_sent_after_tracks_writes_and_deletes() {
        let desired = DesiredState::new("r1").set("secret", Value::text("a"));

        // Never sent: assumed to hold the desired value.
        let assumed = sent_after(&KIND, &desired, &Fingerprints::new(), &ChangeSet::default());
        assert_eq!(assumed.get("secret"), Some(&fingerprint(&Value::text("a"))));

        let mut rotate = ChangeSet::default();
        rotate.updates.insert("secret".into(), Value::text("b"));
        let rotated = sent_after(&KIND, &desired, &assumed, &rotate);
        assert_eq!(rotated.get("secret"), Some(&fingerprint(&Value::text("b"))));

        let delete = ChangeSet {
            deletes: vec!["secret".into()],
            ..Default::default()
        };
        assert!(sent_after(&KIND, &DesiredState::new("r1"), &rotated, &delete).is_empty());
    }

    // =========================================================================
    // Properties
    // =========================================================================

    fn desired_variants() -> Vec<Field<Value>> {
        vec![
            Field::Absent,
            Field::Null,
            Field::Present(Value::text("")),
            Field::Present(Value::text("a")),
            Field::Present(Value::text("b")),
        ]
    }

    fn prior_variants() -> Vec<Option<Value>> {
        vec![None, Some(Value::text("")), Some(Value::text("a")), Some(Value::text("b"))]
    }

    #[test]
    fn test_idempotence_and_disjointness() {
        for want_comment in desired_variants() {
            for want_rate in desired_variants() {
                for have_comment in prior_variants() {
                    for have_rate in prior_variants() {
                        let mut desired = DesiredState::new("r1");
                        desired.fields.insert("comment".into(), want_comment.clone());
                        desired.fields.insert("rate".into(), want_rate.clone());

                        let mut prior = ResourceState::new("r1");
                        if let Some(v) = &have_comment {
                            prior.fields.insert("comment".into(), v.clone());
                        }
                        if let Some(v) = &have_rate {
                            prior.fields.insert("rate".into(), v.clone());
                        }

                        let cs = changes(compute_change_set(&KIND, &desired, Some(&prior)));
                        assert_disjoint(&cs);

                        let next = apply_change_set(&prior, &cs);
                        let again = changes(compute_change_set(&KIND, &desired, Some(&next)));
                        assert!(
                            again.is_empty(),
                            "not idempotent: desired={:?} prior={:?} second={:?}",
                            desired,
                            prior,
                            again
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn test_idempotence_after_create() {
        let desired = DesiredState::new("r1")
            .set("bucket", Value::text("a"))
            .set("notify", block("gc=always"))
            .set("keep-last", Value::Integer(3));

        let cs = changes(compute_change_set(&KIND, &desired, None));
        let created = apply_change_set(&ResourceState::new("r1"), &cs);
        assert!(compute_change_set(&KIND, &desired, Some(&created)).is_noop());
    }
}
