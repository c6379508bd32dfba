use chrono::Duration;
use rust_decimal::Decimal;
use tokio_test::{assert_err, assert_ok};

use library_loans::{
    clock::Clock,
    config::{AppConfig, LoanPolicy},
    models::{BookQuery, LoanQuery, LoanStatus, MemberStatus, NotificationChannel, NotificationKind, NotificationStatus},
    report,
    repository::LibraryStore,
    services::notifications::DispatchSummary,
    AppError, ErrorKind,
};

use crate::common::Harness;

#[tokio::test]
async fn test_single_copy_between_two_members() {
    let h = Harness::new();
    let book = h.book("A Hora da Estrela", 1).await;
    let x = h.member("Xavier").await;
    let y = h.member("Yara").await;

    let loan = assert_ok!(h.services.loans.checkout(x.id, book.id).await);
    assert_eq!(h.available(book.id).await, 0);

    let err = assert_err!(h.services.loans.checkout(y.id, book.id).await);
    assert!(matches!(err, AppError::BookUnavailable(id) if id == book.id));
    assert_eq!(err.kind(), ErrorKind::PreconditionFailed);

    h.clock.advance(Duration::days(3));
    let returned = assert_ok!(h.services.loans.return_loan(loan.id).await);
    assert_eq!(h.available(book.id).await, 1);
    assert_eq!(returned.fine_amount, Some(Decimal::ZERO));
    assert_eq!(returned.return_date, Some(h.clock.now()));

    assert_ok!(h.services.loans.checkout(y.id, book.id).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_checkouts_of_last_copy() {
    let h = Harness::new();
    let book = h.book("Perto do Coracao Selvagem", 1).await;
    let first = h.member("Bento").await;
    let second = h.member("Capitu").await;
    let book_id = book.id;

    let a = tokio::spawn({
        let loans = h.services.loans.clone();
        let member_id = first.id;
        async move { loans.checkout(member_id, book_id).await }
    });
    let b = tokio::spawn({
        let loans = h.services.loans.clone();
        let member_id = second.id;
        async move { loans.checkout(member_id, book_id).await }
    });

    let results = vec![a.await.unwrap(), b.await.unwrap()];
    let won = results.iter().filter(|r| r.is_ok()).count();
    let lost: Vec<_> = results.iter().filter_map(|r| r.as_ref().err()).collect();

    assert_eq!(won, 1);
    assert_eq!(lost.len(), 1);
    assert!(matches!(lost[0], AppError::BookUnavailable(_)));
    assert_eq!(h.available(book_id).await, 0);
    assert_eq!(h.store.loans().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_checkouts_by_one_member_respect_limit() {
    let h = Harness::new();
    let member_id = h.member("Quincas").await.id;
    let mut books = Vec::new();
    for i in 0..6 {
        books.push(h.book(&format!("Volume {}", i), 1).await);
    }

    let handles: Vec<_> = books
        .iter()
        .map(|book| {
            let loans = h.services.loans.clone();
            let book_id = book.id;
            tokio::spawn(async move { loans.checkout(member_id, book_id).await })
        })
        .collect();

    let mut granted = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => granted += 1,
            Err(e) => assert!(matches!(e, AppError::LoanLimitExceeded { limit: 3, .. })),
        }
    }

    assert_eq!(granted, 3);
    let open = h.services.loans.member_loans(member_id).await.unwrap();
    assert_eq!(open.len(), 3);
}

#[tokio::test]
async fn test_fourth_checkout_exceeds_limit() {
    let h = Harness::new();
    let member = h.member("Rubiao").await;
    for i in 0..3 {
        let book = h.book(&format!("Tomo {}", i), 1).await;
        assert_ok!(h.services.loans.checkout(member.id, book.id).await);
    }

    let fourth = h.book("Tomo 3", 1).await;
    let err = assert_err!(h.services.loans.checkout(member.id, fourth.id).await);
    assert!(matches!(err, AppError::LoanLimitExceeded { active: 3, limit: 3, .. }));
    assert_eq!(h.available(fourth.id).await, 1);
}

#[tokio::test]
async fn test_overdue_loan_blocks_new_checkouts() {
    let h = Harness::new();
    let member = h.member("Sofia").await;
    let first = h.book("Laços de Família", 2).await;
    let second = h.book("A Paixão Segundo G.H.", 2).await;

    let loan = h.services.loans.checkout(member.id, first.id).await.unwrap();
    h.clock.set(loan.expected_return_date + Duration::hours(1));

    let err = assert_err!(h.services.loans.checkout(member.id, second.id).await);
    assert!(matches!(err, AppError::MemberBlocked { .. }));
    assert_eq!(h.available(second.id).await, 2);

    // returning the late loan clears the block
    let returned = h.services.loans.return_loan(loan.id).await.unwrap();
    assert_eq!(returned.fine_amount, Some(Decimal::ZERO));
    assert_ok!(h.services.loans.checkout(member.id, second.id).await);
}

#[tokio::test]
async fn test_blocked_member_cannot_borrow() {
    let h = Harness::new();
    let member = h.member("Fabiano").await;
    let book = h.book("Vidas Secas", 1).await;

    h.services
        .members
        .set_status(member.id, MemberStatus::Blocked)
        .await
        .unwrap();
    let err = assert_err!(h.services.loans.checkout(member.id, book.id).await);
    assert!(matches!(err, AppError::MemberBlocked { .. }));

    h.services
        .members
        .set_status(member.id, MemberStatus::Active)
        .await
        .unwrap();
    assert_ok!(h.services.loans.checkout(member.id, book.id).await);
}

#[tokio::test]
async fn test_double_return_increments_stock_once() {
    let h = Harness::new();
    let member = h.member("Baleia").await;
    let book = h.book("Sao Bernardo", 2).await;
    let loan = h.services.loans.checkout(member.id, book.id).await.unwrap();

    h.clock.set(loan.expected_return_date + Duration::days(5) + Duration::minutes(1));
    let returned = assert_ok!(h.services.loans.return_loan(loan.id).await);
    assert_eq!(returned.fine_amount, Some(Decimal::new(1000, 2)));

    h.clock.advance(Duration::days(10));
    let err = assert_err!(h.services.loans.return_loan(loan.id).await);
    assert!(matches!(err, AppError::LoanAlreadyReturned(id) if id == loan.id));
    assert_eq!(h.available(book.id).await, 2);

    // the fine stays as fixed at return time
    let view = h.services.loans.get_loan(loan.id).await.unwrap();
    assert_eq!(view.status, LoanStatus::Returned);
    assert_eq!(view.projected_fine, Decimal::new(1000, 2));
}

#[tokio::test]
async fn test_renewal_rules() {
    let h = Harness::new();
    let member = h.member("Macabea").await;
    let book = h.book("Agua Viva", 1).await;
    let loan = h.services.loans.checkout(member.id, book.id).await.unwrap();

    let renewed = assert_ok!(h.services.loans.renew(loan.id).await);
    assert_eq!(renewed.expected_return_date, loan.expected_return_date + Duration::days(14));

    h.clock.set(renewed.expected_return_date + Duration::seconds(1));
    let err = assert_err!(h.services.loans.renew(loan.id).await);
    assert!(matches!(
        err,
        AppError::LoanNotActive {
            status: LoanStatus::Overdue,
            ..
        }
    ));

    h.services.loans.return_loan(loan.id).await.unwrap();
    let err = assert_err!(h.services.loans.renew(loan.id).await);
    assert!(matches!(
        err,
        AppError::LoanNotActive {
            status: LoanStatus::Returned,
            ..
        }
    ));

    let err = assert_err!(h.services.loans.renew(9999).await);
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_stock_stays_in_range_through_lifecycle() {
    let h = Harness::new();
    let book = h.book("Dom Casmurro", 2).await;
    let members = vec![h.member("Ana").await, h.member("Bia").await, h.member("Caio").await];

    let mut loans = Vec::new();
    for member in &members {
        if let Ok(loan) = h.services.loans.checkout(member.id, book.id).await {
            loans.push(loan);
        }
        let available = h.available(book.id).await;
        assert!((0..=book.total_copies).contains(&available));
    }
    assert_eq!(loans.len(), 2);

    for loan in &loans {
        h.services.loans.return_loan(loan.id).await.unwrap();
        let available = h.available(book.id).await;
        assert!((0..=book.total_copies).contains(&available));
    }
    assert_eq!(h.available(book.id).await, 2);
}

#[tokio::test]
async fn test_checkout_and_return_invalidate_listings() {
    let h = Harness::new();
    let member = h.member("Helena").await;
    let book = h.book("Iaia Garcia", 1).await;

    let listed = h.services.catalog.list_books(&BookQuery::default()).await.unwrap();
    assert_eq!(listed[0].available_copies, 1);
    h.services.catalog.get_book(book.id).await.unwrap();
    assert_eq!(h.cache.keys().len(), 2);

    let loan = h.services.loans.checkout(member.id, book.id).await.unwrap();
    assert!(h.cache.keys().is_empty());

    let listed = h.services.catalog.list_books(&BookQuery::default()).await.unwrap();
    assert_eq!(listed[0].available_copies, 0);
    assert_eq!(h.services.catalog.get_book(book.id).await.unwrap().available_copies, 0);

    h.services.loans.return_loan(loan.id).await.unwrap();
    assert!(h.cache.keys().is_empty());
    assert_eq!(h.services.catalog.get_book(book.id).await.unwrap().available_copies, 1);
}

#[tokio::test]
async fn test_failed_checkout_leaves_cache_alone() {
    let h = Harness::new();
    let member = h.member("Lucia").await;
    let book = h.book("Esau e Jaco", 0).await;

    h.services.catalog.list_books(&BookQuery::default()).await.unwrap();
    assert_err!(h.services.loans.checkout(member.id, book.id).await);
    assert_eq!(h.cache.keys().len(), 1);
}

#[tokio::test]
async fn test_overdue_listing_report_and_stats() {
    let h = Harness::new();
    let ana = h.member("Aurelia").await;
    let bia = h.member("Brites").await;
    let first = h.book("Senhora", 3).await;
    let second = h.book("Lucíola", 3).await;

    let early = h.services.loans.checkout(ana.id, first.id).await.unwrap();
    h.clock.advance(Duration::days(2));
    let late = h.services.loans.checkout(bia.id, second.id).await.unwrap();
    let kept = h.services.loans.checkout(ana.id, second.id).await.unwrap();
    h.services.loans.renew(kept.id).await.unwrap();

    // early is 4 days late, late is 2 days late, kept is still within its renewal
    h.clock.set(late.expected_return_date + Duration::days(2) + Duration::hours(6));

    let overdue = h.services.loans.list_overdue(None, 0, 10).await.unwrap();
    let ids: Vec<_> = overdue.iter().map(|v| v.loan.id).collect();
    assert_eq!(ids, vec![early.id, late.id]);
    assert_eq!(overdue[0].days_late, 4);
    assert_eq!(overdue[0].projected_fine, Decimal::new(800, 2));

    let for_bia = h.services.loans.list_overdue(Some(bia.id), 0, 10).await.unwrap();
    assert_eq!(for_bia.len(), 1);

    let active = h
        .services
        .loans
        .list_loans(&LoanQuery {
            status: Some(LoanStatus::Active),
            ..LoanQuery::default()
        })
        .await
        .unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].loan.id, kept.id);

    let summary = report::run_once(&h.services.loans, 1).await.unwrap();
    assert_eq!(summary.loans, 2);
    assert_eq!(summary.members, 2);
    assert_eq!(summary.projected_fines, Decimal::new(1200, 2));

    h.services.loans.return_loan(early.id).await.unwrap();
    let stats = h.services.stats.loan_stats().await.unwrap();
    assert_eq!((stats.active, stats.overdue, stats.returned), (1, 1, 1));
    assert_eq!(stats.collected_fines, Decimal::new(800, 2));
    assert_eq!(stats.projected_fines, Decimal::new(400, 2));

    // reads never persist derived state
    let stored = h.store.loans();
    assert!(stored
        .iter()
        .filter(|l| l.return_date.is_none())
        .all(|l| l.fine_amount.is_none()));
}

#[tokio::test]
async fn test_policy_from_config() {
    let config = AppConfig {
        loans: LoanPolicy {
            loan_period_days: 7,
            daily_fine_rate: Decimal::new(50, 2),
            max_active_loans: 1,
            max_renewals: Some(0),
        },
        ..AppConfig::default()
    };
    let h = Harness::with_config(config);
    let member = h.member("Iracema").await;
    let book = h.book("O Guarani", 2).await;

    let loan = h.services.loans.checkout(member.id, book.id).await.unwrap();
    assert_eq!(loan.expected_return_date, h.clock.now() + Duration::days(7));

    let err = assert_err!(h.services.loans.checkout(member.id, book.id).await);
    assert!(matches!(err, AppError::LoanLimitExceeded { limit: 1, .. }));

    let err = assert_err!(h.services.loans.renew(loan.id).await);
    assert!(matches!(err, AppError::RenewalNotAllowed { limit: 0, .. }));

    h.clock.advance(Duration::days(10));
    let returned = h.services.loans.return_loan(loan.id).await.unwrap();
    assert_eq!(returned.fine_amount, Some(Decimal::new(150, 2)));
}

#[tokio::test]
async fn test_reminders_follow_the_loan_once() {
    let h = Harness::new();
    let book = h.book("Agua Viva", 2).await;
    let m = h.member("Macabea").await;
    let loan = h.services.loans.checkout(m.id, book.id).await.unwrap();

    // both channels configured, nothing due yet
    let quiet = h.services.notifications.dispatch_due().await.unwrap();
    assert_eq!(quiet.total_sent(), 0);

    h.clock.set(loan.expected_return_date - Duration::days(1));
    let due_soon = h.services.notifications.dispatch_due().await.unwrap();
    assert_eq!((due_soon.due_soon_sent, due_soon.overdue_sent), (2, 0));
    assert_eq!(h.services.notifications.dispatch_due().await.unwrap().total_sent(), 0);

    h.clock.set(loan.expected_return_date + Duration::days(4));
    let overdue = h.services.notifications.dispatch_due().await.unwrap();
    assert_eq!((overdue.due_soon_sent, overdue.overdue_sent), (0, 2));

    let sent = h.store.notifications_for_loan(loan.id).await.unwrap();
    let kinds: Vec<_> = sent.iter().map(|n| (n.kind, n.channel)).collect();
    assert_eq!(
        kinds,
        vec![
            (NotificationKind::DueSoon, NotificationChannel::Email),
            (NotificationKind::DueSoon, NotificationChannel::Webhook),
            (NotificationKind::Overdue, NotificationChannel::Email),
            (NotificationKind::Overdue, NotificationChannel::Webhook),
        ]
    );
    assert!(sent.iter().all(|n| n.status == NotificationStatus::Sent));
    assert_eq!(sent[2].payload["days_overdue"], 4);
    assert_eq!(sent[2].payload["member_email"], "macabea@example.org");

    // returned loans drop out of both windows
    h.services.loans.return_loan(loan.id).await.unwrap();
    h.clock.advance(Duration::days(1));
    assert_eq!(h.services.notifications.dispatch_due().await.unwrap(), DispatchSummary::default());
}
