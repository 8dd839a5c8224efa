//! Proxy lifecycle and signal decoding against the in-memory daemon.

mod common;

use avahi_async::codec::{
    INTERFACE_ENTRY_GROUP, INTERFACE_RECORD_BROWSER, INTERFACE_SERVICE_BROWSER,
    INTERFACE_SERVICE_RESOLVER,
};
use avahi_async::types::{dns_class, dns_type, txt_from_pairs};
use avahi_async::{
    Client, EntryGroup, EntryGroupState, Error, LookupFlags, LookupResultFlags, PublishFlags,
    RecordBrowser, ServiceBrowser, ServiceResolver, IF_UNSPEC, PROTO_INET, PROTO_UNSPEC,
};
use common::{
    completion, connected, eventually, settle, Counter, FakeDaemon, BAD_STATE,
    INVALID_SERVICE_TYPE,
};
use std::sync::{Arc, Mutex};

async fn entry_group(client: &Client) -> Arc<EntryGroup> {
    let (done, reply) = completion();
    client.create_entry_group(done);
    reply.await.unwrap().unwrap()
}

async fn record_browser(client: &Client) -> Arc<RecordBrowser> {
    let (done, reply) = completion();
    client.create_record_browser(
        IF_UNSPEC,
        PROTO_UNSPEC,
        "printer.local",
        dns_class::IN,
        dns_type::A,
        LookupFlags::empty(),
        done,
    );
    reply.await.unwrap().unwrap()
}

async fn service_browser(client: &Client) -> Arc<ServiceBrowser> {
    let (done, reply) = completion();
    client.create_service_browser(
        IF_UNSPEC,
        PROTO_UNSPEC,
        "_ipp._tcp",
        "",
        LookupFlags::empty(),
        done,
    );
    reply.await.unwrap().unwrap()
}

async fn service_resolver(client: &Client) -> Arc<ServiceResolver> {
    let (done, reply) = completion();
    client.create_service_resolver(
        2,
        PROTO_INET,
        "Printer",
        "_ipp._tcp",
        "local",
        PROTO_UNSPEC,
        LookupFlags::NO_TXT,
        done,
    );
    reply.await.unwrap().unwrap()
}

fn collect<T: Clone + Send + 'static>(event: &avahi_async::Event<T>) -> Arc<Mutex<Vec<T>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    event.connect(move |value: &T| sink.lock().unwrap().push(value.clone()));
    seen
}

#[tokio::test]
async fn test_proxy_object_path_comes_from_daemon() {
    let (harness, daemon) = connected().await;

    let group = entry_group(&harness.client).await;
    let browser = service_browser(&harness.client).await;

    assert_eq!(group.object_path(), "/Client1/EntryGroup1");
    assert_eq!(browser.object_path(), "/Client1/ServiceBrowser2");
    assert_eq!(daemon.call_count("EntryGroupNew"), 1);
    assert_eq!(daemon.call_count("ServiceBrowserPrepare"), 1);
}

#[tokio::test]
async fn test_prepare_arguments() {
    let (harness, daemon) = connected().await;

    let _resolver = service_resolver(&harness.client).await;

    let args: (i32, i32, String, String, String, i32, u32) = daemon.calls("ServiceResolverPrepare")
        [0]
    .body()
    .deserialize()
    .unwrap();
    assert_eq!(
        args,
        (
            2,
            PROTO_INET,
            "Printer".to_string(),
            "_ipp._tcp".to_string(),
            "local".to_string(),
            PROTO_UNSPEC,
            LookupFlags::NO_TXT.bits()
        )
    );
}

#[tokio::test]
async fn test_browser_subscribes_before_start() {
    let (harness, daemon) = connected().await;

    let browser = record_browser(&harness.client).await;
    eventually(|| daemon.call_count("Start") == 1).await;

    let path = browser.object_path();
    assert_eq!(
        daemon.log_for(path),
        vec![
            format!("subscribe {} ItemNew", path),
            format!("subscribe {} ItemRemove", path),
            format!("subscribe {} Failure", path),
            format!("subscribe {} AllForNow", path),
            format!("subscribe {} CacheExhausted", path),
            format!("call {} Start", path),
        ]
    );
}

#[tokio::test]
async fn test_entry_group_is_not_started() {
    let (harness, daemon) = connected().await;

    let group = entry_group(&harness.client).await;
    settle().await;

    assert_eq!(daemon.call_count("Start"), 0);
    assert_eq!(
        daemon.log_for(group.object_path()),
        vec![format!("subscribe {} StateChanged", group.object_path())]
    );
}

#[tokio::test]
async fn test_empty_record_browse_reports_all_for_now_once() {
    let (harness, daemon) = connected().await;
    daemon.announce_all_for_now_on_start();

    let items = Counter::default();
    let all_for_now = Counter::default();
    let (i, a) = (items.clone(), all_for_now.clone());
    let (done, reply) = completion();
    harness.client.create_record_browser(
        IF_UNSPEC,
        PROTO_UNSPEC,
        "nobody.local",
        dns_class::IN,
        dns_type::AAAA,
        LookupFlags::empty(),
        move |result: avahi_async::Result<Arc<RecordBrowser>>| {
            if let Ok(browser) = &result {
                browser.item_new().connect(move |_| i.bump());
                browser.all_for_now().connect(move |_| a.bump());
            }
            done(result);
        },
    );
    let _browser = reply.await.unwrap().unwrap();

    eventually(|| all_for_now.get() == 1).await;
    settle().await;
    assert_eq!(all_for_now.get(), 1);
    assert_eq!(items.get(), 0);
}

#[tokio::test]
async fn test_teardown_unsubscribes_before_free() {
    let (harness, daemon) = connected().await;

    let browser = service_browser(&harness.client).await;
    eventually(|| daemon.call_count("Start") == 1).await;
    let path = browser.object_path().to_string();

    drop(browser);
    eventually(|| daemon.call_count("Free") == 1).await;
    settle().await;

    let log = daemon.log_for(&path);
    let teardown = &log[log.len() - 6..];
    for entry in &teardown[..5] {
        assert!(entry.starts_with("unsubscribe "), "{}", entry);
    }
    assert_eq!(teardown[5], format!("call {} Free", path));
    assert_eq!(daemon.call_count("Free"), 1);
    assert_eq!(daemon.active_subscriptions(), 1);
}

#[tokio::test]
async fn test_unkept_proxy_is_freed_without_start() {
    let (harness, daemon) = connected().await;

    harness.client.create_service_browser(
        IF_UNSPEC,
        PROTO_UNSPEC,
        "_ipp._tcp",
        "",
        LookupFlags::empty(),
        |_browser| {},
    );

    eventually(|| daemon.call_count("Free") == 1).await;
    assert_eq!(daemon.call_count("Start"), 0);
    assert_eq!(daemon.active_subscriptions(), 1);
}

#[tokio::test]
async fn test_handler_releasing_browser_on_all_for_now() {
    let (harness, daemon) = connected().await;
    daemon.announce_all_for_now_on_start();
    let fired = Counter::default();

    let f = fired.clone();
    harness.client.create_record_browser(
        IF_UNSPEC,
        PROTO_UNSPEC,
        "printer.local",
        dns_class::IN,
        dns_type::A,
        LookupFlags::empty(),
        move |result: avahi_async::Result<Arc<RecordBrowser>>| {
            let browser = result.unwrap();
            let keep = browser.clone();
            browser.all_for_now().connect(move |_| {
                f.bump();
                keep.all_for_now().clear();
            });
        },
    );

    eventually(|| daemon.call_count("Free") == 1).await;
    assert_eq!(fired.get(), 1);
    assert_eq!(daemon.active_subscriptions(), 1);
}

#[tokio::test]
async fn test_no_free_after_daemon_vanished() {
    let (harness, daemon) = connected().await;

    let resolver = service_resolver(&harness.client).await;
    eventually(|| daemon.call_count("Start") == 1).await;

    harness.vanish().await;
    drop(resolver);
    settle().await;

    assert_eq!(daemon.call_count("Free"), 0);
    assert_eq!(daemon.active_subscriptions(), 0);
}

#[tokio::test]
async fn test_old_proxy_is_not_revalidated_after_reconnect() {
    let (harness, first) = connected().await;
    let group = entry_group(&harness.client).await;

    harness.vanish().await;
    let second = FakeDaemon::new();
    harness.appear(&second).await;

    let (done, reply) = completion();
    group.commit(done);
    assert!(matches!(reply.await.unwrap(), Err(Error::NotConnected)));

    drop(group);
    settle().await;
    assert_eq!(first.call_count("Free"), 0);
    assert_eq!(second.call_count("Free"), 0);
    assert_eq!(first.active_subscriptions(), 0);
    assert_eq!(second.active_subscriptions(), 1);
}

#[tokio::test]
async fn test_malformed_signal_reports_once() {
    let (harness, daemon) = connected().await;
    let browser = service_browser(&harness.client).await;

    let items = collect(browser.item_new());
    let removed = collect(browser.item_remove());
    let failures = collect(browser.failure());
    let errors = collect(browser.error_log());

    daemon.emit(
        browser.object_path(),
        INTERFACE_SERVICE_BROWSER,
        "ItemNew",
        &(2i32, "Printer"),
    );

    assert_eq!(
        *errors.lock().unwrap(),
        vec!["ServiceBrowser: Cannot parse \"ItemNew\" parameters".to_string()]
    );
    assert!(items.lock().unwrap().is_empty());
    assert!(removed.lock().unwrap().is_empty());
    assert!(failures.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_service_browser_items() {
    let (harness, daemon) = connected().await;
    let browser = service_browser(&harness.client).await;
    let items = collect(browser.item_new());
    let removed = collect(browser.item_remove());

    let payload = (2i32, 0i32, "Printer", "_ipp._tcp", "local", 8u32);
    daemon.emit(browser.object_path(), INTERFACE_SERVICE_BROWSER, "ItemNew", &payload);
    daemon.emit(browser.object_path(), INTERFACE_SERVICE_BROWSER, "ItemRemove", &payload);

    let items = items.lock().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].interface, 2);
    assert_eq!(items[0].name, "Printer");
    assert_eq!(items[0].service_type, "_ipp._tcp");
    assert_eq!(items[0].domain, "local");
    assert_eq!(items[0].flags, LookupResultFlags::LOCAL);
    assert_eq!(*removed.lock().unwrap(), *items);
}

#[tokio::test]
async fn test_signals_for_other_objects_are_ignored() {
    let (harness, daemon) = connected().await;
    let first = service_browser(&harness.client).await;
    let second = service_browser(&harness.client).await;
    let items = collect(first.item_new());

    let payload = (2i32, 0i32, "Printer", "_ipp._tcp", "local", 0u32);
    daemon.emit(second.object_path(), INTERFACE_SERVICE_BROWSER, "ItemNew", &payload);

    assert!(items.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_record_browser_items_and_failure() {
    let (harness, daemon) = connected().await;
    let browser = record_browser(&harness.client).await;
    let items = collect(browser.item_new());
    let failures = collect(browser.failure());
    let exhausted = Counter::default();
    let e = exhausted.clone();
    browser.cache_exhausted().connect(move |_| e.bump());

    let path = browser.object_path();
    daemon.emit(
        path,
        INTERFACE_RECORD_BROWSER,
        "ItemNew",
        &(2i32, 0i32, "printer.local", 1u16, 1u16, vec![192u8, 168, 1, 20], 1u32),
    );
    daemon.emit(path, INTERFACE_RECORD_BROWSER, "CacheExhausted", &());
    daemon.emit(path, INTERFACE_RECORD_BROWSER, "Failure", &"Timeout reached");

    let items = items.lock().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].name, "printer.local");
    assert_eq!(items[0].record_type, dns_type::A);
    assert_eq!(items[0].data, vec![192, 168, 1, 20]);
    assert_eq!(items[0].flags, LookupResultFlags::CACHED);
    assert_eq!(exhausted.get(), 1);
    assert_eq!(*failures.lock().unwrap(), vec!["Timeout reached".to_string()]);
}

#[tokio::test]
async fn test_resolver_found() {
    let (harness, daemon) = connected().await;
    let resolver = service_resolver(&harness.client).await;
    let found = collect(resolver.found());

    daemon.emit(
        resolver.object_path(),
        INTERFACE_SERVICE_RESOLVER,
        "Found",
        &(
            2i32,
            0i32,
            "Printer",
            "_ipp._tcp",
            "local",
            "printer.local",
            0i32,
            "192.168.1.20",
            631u16,
            txt_from_pairs(["rp=ipp/print", "note=2nd floor"]),
            8u32,
        ),
    );

    let found = found.lock().unwrap();
    assert_eq!(found.len(), 1);
    let service = &found[0];
    assert_eq!(service.host, "printer.local");
    assert_eq!(service.address, "192.168.1.20");
    assert_eq!(service.port, 631);
    assert_eq!(service.txt_strings(), vec!["rp=ipp/print", "note=2nd floor"]);
    assert_eq!(service.flags, LookupResultFlags::LOCAL);
}

#[tokio::test]
async fn test_resolver_failure_and_malformed_found() {
    let (harness, daemon) = connected().await;
    let resolver = service_resolver(&harness.client).await;
    let found = collect(resolver.found());
    let failures = collect(resolver.failure());
    let errors = collect(resolver.error_log());

    let path = resolver.object_path();
    daemon.emit(path, INTERFACE_SERVICE_RESOLVER, "Found", &(2i32, 0i32, "Printer"));
    daemon.emit(path, INTERFACE_SERVICE_RESOLVER, "Failure", &"Timeout reached");

    assert!(found.lock().unwrap().is_empty());
    assert_eq!(
        *errors.lock().unwrap(),
        vec!["ServiceResolver: Cannot parse \"Found\" parameters".to_string()]
    );
    assert_eq!(*failures.lock().unwrap(), vec!["Timeout reached".to_string()]);
}

#[tokio::test]
async fn test_start_failure_goes_to_error_log() {
    let (harness, daemon) = connected().await;
    daemon.fail(
        "Start",
        "org.freedesktop.Avahi.NotPermittedError",
        "Not permitted",
    );

    let errors = Arc::new(Mutex::new(Vec::new()));
    let kept = Arc::new(Mutex::new(None));
    let (sink, slot) = (errors.clone(), kept.clone());
    harness.client.create_service_resolver(
        IF_UNSPEC,
        PROTO_UNSPEC,
        "Printer",
        "_ipp._tcp",
        "",
        PROTO_UNSPEC,
        LookupFlags::empty(),
        move |result: avahi_async::Result<Arc<ServiceResolver>>| {
            let resolver = result.unwrap();
            resolver
                .error_log()
                .connect(move |message: &String| sink.lock().unwrap().push(message.clone()));
            *slot.lock().unwrap() = Some(resolver);
        },
    );

    eventually(|| !errors.lock().unwrap().is_empty()).await;
    assert_eq!(
        errors.lock().unwrap()[0],
        "ServiceResolver: D-Bus call \"Start\" failed: \
         org.freedesktop.Avahi.NotPermittedError: Not permitted"
    );
}

#[tokio::test]
async fn test_commit_rejected_after_invalid_service() {
    let (harness, daemon) = connected().await;
    let group = entry_group(&harness.client).await;

    let (done, reply) = completion();
    group.add_service(
        IF_UNSPEC,
        PROTO_UNSPEC,
        PublishFlags::empty(),
        "My Printer",
        "ipp",
        "",
        "",
        631,
        &[],
        done,
    );
    let err = reply.await.unwrap().unwrap_err();
    assert_eq!(err.daemon_error_name(), Some(INVALID_SERVICE_TYPE));

    let (done, reply) = completion();
    group.commit(done);
    let err = reply.await.unwrap().unwrap_err();
    assert_eq!(err.daemon_error_name(), Some(BAD_STATE));
    assert_eq!(daemon.call_count("Commit"), 1);
}

#[tokio::test]
async fn test_publish_service() {
    let (harness, daemon) = connected().await;
    let group = entry_group(&harness.client).await;
    let states = collect(group.state_changed());
    let txt = txt_from_pairs(["rp=ipp/print"]);

    let (done, reply) = completion();
    group.add_service(
        IF_UNSPEC,
        PROTO_UNSPEC,
        PublishFlags::empty(),
        "My Printer",
        "_ipp._tcp",
        "",
        "",
        631,
        &txt,
        done,
    );
    reply.await.unwrap().unwrap();

    let (done, reply) = completion();
    group.add_service_subtype(
        IF_UNSPEC,
        PROTO_UNSPEC,
        PublishFlags::empty(),
        "My Printer",
        "_ipp._tcp",
        "",
        "_universal._sub._ipp._tcp",
        done,
    );
    reply.await.unwrap().unwrap();

    let (done, reply) = completion();
    group.commit(done);
    reply.await.unwrap().unwrap();

    assert_eq!(
        *states.lock().unwrap(),
        vec![
            (EntryGroupState::Registering, String::new()),
            (EntryGroupState::Established, String::new()),
        ]
    );

    let args: (i32, i32, u32, String, String, String, String, u16, Vec<Vec<u8>>) =
        daemon.calls("AddService")[0].body().deserialize().unwrap();
    assert_eq!(args.3, "My Printer");
    assert_eq!(args.4, "_ipp._tcp");
    assert_eq!(args.7, 631);
    assert_eq!(args.8, txt);

    let subtype: (i32, i32, u32, String, String, String, String) =
        daemon.calls("AddServiceSubtype")[0].body().deserialize().unwrap();
    assert_eq!(subtype.6, "_universal._sub._ipp._tcp");
}

#[tokio::test]
async fn test_update_txt_and_reset() {
    let (harness, daemon) = connected().await;
    let group = entry_group(&harness.client).await;

    let (done, reply) = completion();
    group.add_service(
        IF_UNSPEC,
        PROTO_UNSPEC,
        PublishFlags::empty(),
        "My Printer",
        "_ipp._tcp",
        "",
        "",
        631,
        &[],
        done,
    );
    reply.await.unwrap().unwrap();

    let (done, reply) = completion();
    group.is_empty(done);
    assert!(!reply.await.unwrap().unwrap());

    let (done, reply) = completion();
    group.update_service_txt(
        IF_UNSPEC,
        PROTO_UNSPEC,
        PublishFlags::empty(),
        "My Printer",
        "_ipp._tcp",
        "",
        &txt_from_pairs(["paper=A4"]),
        done,
    );
    reply.await.unwrap().unwrap();
    let (_, _, _, _, _, _, txt): (i32, i32, u32, String, String, String, Vec<Vec<u8>>) =
        daemon.calls("UpdateServiceTxt")[0].body().deserialize().unwrap();
    assert_eq!(txt, vec![b"paper=A4".to_vec()]);

    let (done, reply) = completion();
    group.reset(done);
    reply.await.unwrap().unwrap();

    let (done, reply) = completion();
    group.is_empty(done);
    assert!(reply.await.unwrap().unwrap());

    let (done, reply) = completion();
    group.get_state(done);
    assert_eq!(reply.await.unwrap().unwrap(), EntryGroupState::Uncommitted);
}

#[tokio::test]
async fn test_malformed_group_state() {
    let (harness, daemon) = connected().await;
    let group = entry_group(&harness.client).await;
    let states = collect(group.state_changed());
    let errors = collect(group.error_log());

    daemon.emit(group.object_path(), INTERFACE_ENTRY_GROUP, "StateChanged", &(9i32, ""));

    assert!(states.lock().unwrap().is_empty());
    assert_eq!(
        *errors.lock().unwrap(),
        vec!["EntryGroup: Cannot parse \"StateChanged\" parameters".to_string()]
    );
}
