//! Integration tests for permission rows and sync bookkeeping.

mod test_utils;

use chrono::{Duration, Utc};
use permsync::extsvc::SERVICE_TYPE_GITHUB;
use permsync::models::{Repo, User, repo, user};
use permsync::repositories::PermsStore;
use permsync::repositories::perms::{SOURCE_API, SOURCE_SYNC, SetPermissionsResult};
use sea_orm::{ActiveModelTrait, DatabaseConnection, EntityTrait, Set};
use test_utils::{GITHUB_SERVICE_ID, create_github_repo, create_repo, create_user, setup_test_db};

async fn backdate_user(db: &DatabaseConnection, id: i32, age: Duration) {
    let mut active: user::ActiveModel = User::find_by_id(id).one(db).await.unwrap().unwrap().into();
    active.perms_synced_at = Set(Some((Utc::now() - age).fixed_offset()));
    active.update(db).await.unwrap();
}

async fn backdate_repo(db: &DatabaseConnection, id: i32, age: Duration) {
    let mut active: repo::ActiveModel = Repo::find_by_id(id).one(db).await.unwrap().unwrap().into();
    active.perms_synced_at = Set(Some((Utc::now() - age).fixed_offset()));
    active.update(db).await.unwrap();
}

#[tokio::test]
async fn user_permissions_are_diffed_and_stamped() {
    let db = setup_test_db().await.unwrap();
    let perms = PermsStore::new(db.clone());
    let alice = create_user(&db, "alice", false).await;
    let r1 = create_github_repo(&db, "acme/one", "R_1").await;
    let r2 = create_github_repo(&db, "acme/two", "R_2").await;
    let r3 = create_github_repo(&db, "acme/three", "R_3").await;

    let first = perms
        .set_user_repo_permissions(alice.id, &[r1.id, r2.id], SOURCE_SYNC)
        .await
        .unwrap();
    assert_eq!(first, SetPermissionsResult { added: 2, removed: 0, found: 2 });

    let second = perms
        .set_user_repo_permissions(alice.id, &[r2.id, r3.id, r3.id], SOURCE_SYNC)
        .await
        .unwrap();
    assert_eq!(second, SetPermissionsResult { added: 1, removed: 1, found: 2 });
    assert_eq!(
        perms.repo_ids_for_user(alice.id, SOURCE_SYNC).await.unwrap(),
        vec![r2.id, r3.id]
    );

    let stamped = User::find_by_id(alice.id).one(&db).await.unwrap().unwrap();
    assert!(stamped.perms_synced_at.is_some());
}

#[tokio::test]
async fn sources_do_not_clobber_each_other() {
    let db = setup_test_db().await.unwrap();
    let perms = PermsStore::new(db.clone());
    let alice = create_user(&db, "alice", false).await;
    let bob = create_user(&db, "bob", false).await;
    let repo = create_github_repo(&db, "acme/one", "R_1").await;

    perms
        .set_repo_permissions(repo.id, &[alice.id], SOURCE_API)
        .await
        .unwrap();

    // The sync source sees alice already granted and leaves that row alone.
    let synced = perms
        .set_repo_permissions(repo.id, &[alice.id, bob.id], SOURCE_SYNC)
        .await
        .unwrap();
    assert_eq!(synced.added, 1);
    assert_eq!(perms.user_ids_for_repo(repo.id, SOURCE_SYNC).await.unwrap(), vec![bob.id]);
    assert_eq!(perms.user_ids_for_repo(repo.id, SOURCE_API).await.unwrap(), vec![alice.id]);

    let cleared = perms.set_repo_permissions(repo.id, &[], SOURCE_SYNC).await.unwrap();
    assert_eq!(cleared, SetPermissionsResult { added: 0, removed: 1, found: 0 });
    assert_eq!(perms.user_ids_for_repo(repo.id, SOURCE_API).await.unwrap(), vec![alice.id]);
}

#[tokio::test]
async fn no_perms_counts_only_private_repos() {
    let db = setup_test_db().await.unwrap();
    let perms = PermsStore::new(db.clone());
    create_user(&db, "alice", false).await;
    let bob = create_user(&db, "bob", false).await;
    let private = create_github_repo(&db, "acme/private", "R_1").await;
    create_repo(&db, "github.com/acme/public", false, SERVICE_TYPE_GITHUB, GITHUB_SERVICE_ID, "R_2").await;

    assert_eq!(perms.count_users_with_no_permissions().await.unwrap(), 2);
    assert_eq!(perms.count_repos_with_no_permissions().await.unwrap(), 1);

    perms.set_user_repo_permissions(bob.id, &[], SOURCE_SYNC).await.unwrap();
    perms.mark_repo_synced(private.id).await.unwrap();

    assert_eq!(perms.count_users_with_no_permissions().await.unwrap(), 1);
    assert_eq!(perms.count_repos_with_no_permissions().await.unwrap(), 0);
    assert!(perms.user_ids_for_repo(private.id, SOURCE_SYNC).await.unwrap().is_empty());
}

#[tokio::test]
async fn subjects_needing_sync_split_by_reason() {
    let db = setup_test_db().await.unwrap();
    let perms = PermsStore::new(db.clone());
    let never = create_user(&db, "never", false).await;
    let fresh = create_user(&db, "fresh", false).await;
    let old = create_user(&db, "old", false).await;
    let older = create_user(&db, "older", false).await;
    let stale_repo = create_github_repo(&db, "acme/stale", "R_1").await;
    let new_repo = create_github_repo(&db, "acme/new", "R_2").await;

    backdate_user(&db, fresh.id, Duration::minutes(1)).await;
    backdate_user(&db, old.id, Duration::days(2)).await;
    backdate_user(&db, older.id, Duration::days(5)).await;
    backdate_repo(&db, stale_repo.id, Duration::days(3)).await;

    let stale_after = Duration::days(1);
    let users = perms.user_ids_needing_sync(stale_after, 10).await.unwrap();
    assert_eq!(users.no_perms, vec![never.id]);
    assert_eq!(users.stale, vec![older.id, old.id], "oldest first");

    let limited = perms.user_ids_needing_sync(stale_after, 1).await.unwrap();
    assert_eq!(limited.stale, vec![older.id]);

    let repos = perms.repo_ids_needing_sync(stale_after, 10).await.unwrap();
    assert_eq!(repos.no_perms, vec![new_repo.id]);
    assert_eq!(repos.stale, vec![stale_repo.id]);

    assert_eq!(perms.count_users_with_stale_permissions(stale_after).await.unwrap(), 2);
    assert_eq!(perms.count_repos_with_stale_permissions(stale_after).await.unwrap(), 1);
}

#[tokio::test]
async fn large_grant_sets_are_written_in_batches() {
    let db = setup_test_db().await.unwrap();
    let perms = PermsStore::new(db.clone()).with_write_batch_size(2);
    let repo = create_github_repo(&db, "acme/big", "R_1").await;
    let mut users = Vec::new();
    for i in 0..7 {
        users.push(create_user(&db, &format!("user{i}"), false).await.id);
    }

    let first = perms
        .set_repo_permissions(repo.id, &users[..5], SOURCE_SYNC)
        .await
        .unwrap();
    assert_eq!(first, SetPermissionsResult { added: 5, removed: 0, found: 5 });

    let second = perms
        .set_repo_permissions(repo.id, &users[2..], SOURCE_SYNC)
        .await
        .unwrap();
    assert_eq!(second, SetPermissionsResult { added: 2, removed: 2, found: 5 });
    assert_eq!(
        perms.user_ids_for_repo(repo.id, SOURCE_SYNC).await.unwrap(),
        users[2..].to_vec()
    );
}
