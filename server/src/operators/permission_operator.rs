use crate::data::models::{DocumentGroup, DocumentVersion, LoggedUser, Visibility};
use serde_json::json;

/// The attributes the visibility predicate reads. Built from a version and
/// its owning group; mirrored verbatim into every chunk document at index
/// time so the same predicate holds at query time.
#[derive(Debug, Clone)]
pub struct PermissionRecord {
    pub owner_id: uuid::Uuid,
    pub org_id: Option<uuid::Uuid>,
    pub visibility: Visibility,
    pub shared_user_ids: Vec<uuid::Uuid>,
    pub shared_role_codes: Vec<String>,
}

impl PermissionRecord {
    pub fn from_version(group: &DocumentGroup, version: &DocumentVersion) -> Self {
        PermissionRecord {
            owner_id: group.owner_id,
            org_id: group.org_id,
            visibility: Visibility::parse(&version.visibility).unwrap_or(Visibility::Private),
            shared_user_ids: version.shared_user_ids.clone(),
            shared_role_codes: version.shared_role_codes.clone(),
        }
    }
}

/// The single visibility predicate, evaluated in-process for metadata reads.
/// The query-time filter emitted by [`permission_filter_fragment`] must admit
/// exactly the same records.
pub fn can_view(user: Option<&LoggedUser>, record: &PermissionRecord) -> bool {
    if record.visibility == Visibility::Public {
        return true;
    }

    let user = match user {
        Some(user) => user,
        None => return false,
    };

    if user.is_superuser || record.owner_id == user.id {
        return true;
    }

    if record.visibility == Visibility::Organization
        && record.org_id.is_some()
        && record.org_id == user.org_id
    {
        return true;
    }

    if record.shared_user_ids.contains(&user.id) {
        return true;
    }

    record
        .shared_role_codes
        .iter()
        .any(|code| user.roles.contains(code))
}

/// Mutation rights: owner or superuser only. Shares and visibility changes
/// can widen access but never hand out mutation.
pub fn can_modify(user: &LoggedUser, record: &PermissionRecord) -> bool {
    user.is_superuser || record.owner_id == user.id
}

/// The predicate as a bool query fragment for the index store. Returns None
/// for superusers, who see everything unfiltered.
pub fn permission_filter_fragment(user: Option<&LoggedUser>) -> Option<serde_json::Value> {
    let mut should = vec![json!({"term": {"metadata.visibility": "public"}})];

    match user {
        None => {}
        Some(user) if user.is_superuser => return None,
        Some(user) => {
            should.push(json!({"term": {"metadata.owner_id": user.id.to_string()}}));

            if let Some(org_id) = user.org_id {
                should.push(json!({
                    "bool": {
                        "must": [
                            {"term": {"metadata.visibility": "organization"}},
                            {"term": {"metadata.org_id": org_id.to_string()}}
                        ]
                    }
                }));
            }

            should.push(json!({"term": {"metadata.shared_with_users": user.id.to_string()}}));

            if !user.roles.is_empty() {
                should.push(json!({"terms": {"metadata.shared_with_roles": user.roles}}));
            }
        }
    }

    Some(json!({
        "bool": {
            "should": should,
            "minimum_should_match": 1
        }
    }))
}

/// Shares may only reference users of the record's organization, unless a
/// superuser initiates the share.
pub fn share_targets_allowed(
    initiator: &LoggedUser,
    record_org: Option<uuid::Uuid>,
    target_orgs: &[Option<uuid::Uuid>],
) -> bool {
    if initiator.is_superuser {
        return true;
    }

    target_orgs
        .iter()
        .all(|target_org| target_org.is_some() && *target_org == record_org)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(org: Option<uuid::Uuid>, roles: Vec<&str>, superuser: bool) -> LoggedUser {
        LoggedUser {
            id: uuid::Uuid::new_v4(),
            username: "tester".to_string(),
            email: "tester@example.com".to_string(),
            org_id: org,
            is_superuser: superuser,
            roles: roles.into_iter().map(|r| r.to_string()).collect(),
        }
    }

    fn record(owner: uuid::Uuid, org: Option<uuid::Uuid>, visibility: Visibility) -> PermissionRecord {
        PermissionRecord {
            owner_id: owner,
            org_id: org,
            visibility,
            shared_user_ids: vec![],
            shared_role_codes: vec![],
        }
    }

    #[test]
    fn anonymous_sees_only_public() {
        let owner = uuid::Uuid::new_v4();
        assert!(can_view(None, &record(owner, None, Visibility::Public)));
        assert!(!can_view(None, &record(owner, None, Visibility::Private)));
        assert!(!can_view(
            None,
            &record(owner, Some(uuid::Uuid::new_v4()), Visibility::Organization)
        ));
    }

    #[test]
    fn owner_and_superuser_always_see() {
        let acme = Some(uuid::Uuid::new_v4());
        let alice = user(acme, vec!["editor"], false);
        let root = user(None, vec![], true);

        let private_doc = record(alice.id, acme, Visibility::Private);
        assert!(can_view(Some(&alice), &private_doc));
        assert!(can_view(Some(&root), &private_doc));
        assert!(can_modify(&alice, &private_doc));
        assert!(can_modify(&root, &private_doc));
    }

    #[test]
    fn organization_visibility_requires_same_org() {
        let acme = Some(uuid::Uuid::new_v4());
        let beta = Some(uuid::Uuid::new_v4());
        let owner = uuid::Uuid::new_v4();
        let doc = record(owner, acme, Visibility::Organization);

        assert!(can_view(Some(&user(acme, vec![], false)), &doc));
        assert!(!can_view(Some(&user(beta, vec![], false)), &doc));
        assert!(!can_view(Some(&user(None, vec![], false)), &doc));
    }

    #[test]
    fn shares_augment_but_do_not_grant_modify() {
        let acme = Some(uuid::Uuid::new_v4());
        let carol = user(Some(uuid::Uuid::new_v4()), vec!["viewer"], false);
        let mut doc = record(uuid::Uuid::new_v4(), acme, Visibility::Organization);

        assert!(!can_view(Some(&carol), &doc));

        doc.shared_user_ids.push(carol.id);
        assert!(can_view(Some(&carol), &doc));
        assert!(!can_modify(&carol, &doc));

        doc.shared_user_ids.clear();
        doc.shared_role_codes.push("viewer".to_string());
        assert!(can_view(Some(&carol), &doc));
    }

    #[test]
    fn fragment_superuser_is_unfiltered() {
        assert!(permission_filter_fragment(Some(&user(None, vec![], true))).is_none());
    }

    #[test]
    fn fragment_anonymous_is_public_only() {
        let fragment = permission_filter_fragment(None).unwrap();
        let should = fragment["bool"]["should"].as_array().unwrap();
        assert_eq!(should.len(), 1);
        assert_eq!(
            should[0]["term"]["metadata.visibility"],
            serde_json::json!("public")
        );
        assert_eq!(fragment["bool"]["minimum_should_match"], 1);
    }

    #[test]
    fn fragment_carries_all_grant_paths() {
        let acme = uuid::Uuid::new_v4();
        let caller = user(Some(acme), vec!["viewer", "editor"], false);
        let fragment = permission_filter_fragment(Some(&caller)).unwrap();
        let should = fragment["bool"]["should"].as_array().unwrap();

        // public, owner, org pair, shared user, shared roles
        assert_eq!(should.len(), 5);
        assert_eq!(
            should[1]["term"]["metadata.owner_id"],
            serde_json::json!(caller.id.to_string())
        );
        assert_eq!(
            should[2]["bool"]["must"][1]["term"]["metadata.org_id"],
            serde_json::json!(acme.to_string())
        );
        assert_eq!(
            should[4]["terms"]["metadata.shared_with_roles"],
            serde_json::json!(["viewer", "editor"])
        );
    }

    #[test]
    fn share_targets_must_match_org() {
        let acme = Some(uuid::Uuid::new_v4());
        let beta = Some(uuid::Uuid::new_v4());
        let alice = user(acme, vec![], false);
        let root = user(None, vec![], true);

        assert!(share_targets_allowed(&alice, acme, &[acme, acme]));
        assert!(!share_targets_allowed(&alice, acme, &[acme, beta]));
        assert!(!share_targets_allowed(&alice, acme, &[None]));
        assert!(share_targets_allowed(&root, acme, &[beta, None]));
    }
}
