//! Request/reply between attached applications

mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use cameo_rs::client::This;
use cameo_rs::coms::basic::Responder;
use cameo_rs::coms::multi::ResponderRouter;
use cameo_rs::coms::{Requester, RequesterOptions};
use cameo_rs::Error;
use tokio::time::timeout;

use common::{instance_of, Registry, TEST_TIMEOUT};

#[tokio::test]
async fn test_basic_round_trip() {
    common::init_tracing();
    let registry = Registry::start(42000).await;
    let server_app = registry.attach("server").await;
    let client_app = registry.attach("client").await;

    let responder = Responder::create(&server_app, "echo").await.unwrap();
    assert!(responder.to_string().starts_with("rep.echo:server."));

    let serving = tokio::spawn(async move {
        let request = responder.receive().await.unwrap();
        assert_eq!(request.application_name(), "client");
        let reply = request.get_string().to_uppercase();
        assert!(request.reply(reply).unwrap());
        responder
    });

    let target = instance_of(&client_app, &server_app).await;
    let requester = Requester::create(&client_app, &target, "echo").await.unwrap();
    assert!(requester.to_string().starts_with("req.echo:server."));

    requester.send("hello").await.unwrap();
    let reply = timeout(TEST_TIMEOUT, requester.receive()).await.unwrap();
    assert_eq!(reply, Some(Bytes::from_static(b"HELLO")));

    timeout(TEST_TIMEOUT, serving).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_two_part_request() {
    let registry = Registry::start(42050).await;
    let server_app = registry.attach("server").await;
    let client_app = registry.attach("client").await;

    let responder = Responder::create(&server_app, "concat").await.unwrap();
    tokio::spawn(async move {
        while let Some(request) = responder.receive().await {
            let second = request.second_part().cloned().unwrap_or_default();
            request.reply_two_parts(request.get().clone(), second).unwrap();
        }
    });

    let target = instance_of(&client_app, &server_app).await;
    let requester = Requester::create(&client_app, &target, "concat").await.unwrap();

    for i in 0..3 {
        requester
            .send_two_parts(format!("a{}", i), format!("b{}", i))
            .await
            .unwrap();
        let (first, second) = timeout(TEST_TIMEOUT, requester.receive_two_parts())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first, Bytes::from(format!("a{}", i)));
        assert_eq!(second, Bytes::from(format!("b{}", i)));
    }
}

#[tokio::test]
async fn test_requester_discovers_late_responder() {
    let registry = Registry::start(42100).await;
    let server_app = registry.attach("server").await;
    let client_app = registry.attach("client").await;

    let late = {
        let server_app = server_app.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            let responder = Responder::create(&server_app, "late").await.unwrap();
            let request = responder.receive().await.unwrap();
            request.reply("found").unwrap();
            responder
        })
    };

    let target = instance_of(&client_app, &server_app).await;
    let requester = timeout(
        TEST_TIMEOUT,
        Requester::create(&client_app, &target, "late"),
    )
    .await
    .unwrap()
    .unwrap();

    requester.send("ping").await.unwrap();
    let reply = timeout(TEST_TIMEOUT, requester.receive()).await.unwrap();
    assert_eq!(reply, Some(Bytes::from_static(b"found")));

    late.await.unwrap();
}

#[tokio::test]
async fn test_duplicate_responder_rejected() {
    let registry = Registry::start(42150).await;
    let app = registry.attach("server").await;

    let _first = Responder::create(&app, "unique").await.unwrap();
    match Responder::create(&app, "unique").await {
        Err(Error::Creation(message)) => assert!(message.contains("unique")),
        Err(other) => panic!("unexpected error {}", other),
        Ok(_) => panic!("duplicate responder created"),
    }
}

#[tokio::test]
async fn test_discovery_fails_when_app_terminates() {
    let registry = Registry::start(42200).await;
    let server_app = registry.attach("server").await;
    let client_app = registry.attach("client").await;

    let target = instance_of(&client_app, &server_app).await;
    let creating = {
        let client_app = client_app.clone();
        tokio::spawn(async move { Requester::create(&client_app, &target, "never").await.err() })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    server_app.terminate().await.unwrap();

    let error = timeout(TEST_TIMEOUT, creating).await.unwrap().unwrap();
    assert!(matches!(error, Some(Error::Creation(_))));
}

#[tokio::test]
async fn test_responder_cancel_unblocks_receive() {
    let registry = Registry::start(42250).await;
    let app = registry.attach("server").await;

    let responder = Arc::new(Responder::create(&app, "idle").await.unwrap());
    let receiving = {
        let responder = responder.clone();
        tokio::spawn(async move { responder.receive().await.is_none() })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    responder.cancel();

    assert!(timeout(TEST_TIMEOUT, receiving).await.unwrap().unwrap());
    assert!(responder.is_canceled());
    assert!(responder.receive().await.is_none());
}

#[tokio::test]
async fn test_requester_cancel_and_timeout() {
    let registry = Registry::start(42300).await;
    let server_app = registry.attach("server").await;
    let client_app = registry.attach("client").await;

    // Acknowledges syncs but never replies.
    let responder = Arc::new(Responder::create(&server_app, "silent").await.unwrap());
    {
        let responder = responder.clone();
        tokio::spawn(async move { while responder.receive().await.is_some() {} });
    }

    let target = instance_of(&client_app, &server_app).await;
    let requester = Arc::new(
        Requester::create_with(
            &client_app,
            &target,
            "silent",
            RequesterOptions::default().timeout(Duration::from_millis(200)),
        )
        .await
        .unwrap(),
    );

    requester.send("ping").await.unwrap();
    assert_eq!(timeout(TEST_TIMEOUT, requester.receive()).await.unwrap(), None);
    assert!(requester.has_timed_out());
    assert!(!requester.is_canceled());

    requester.set_timeout(None);
    requester.send("ping").await.unwrap();
    let receiving = {
        let requester = requester.clone();
        tokio::spawn(async move { requester.receive().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    requester.cancel();

    assert_eq!(timeout(TEST_TIMEOUT, receiving).await.unwrap().unwrap(), None);
    assert!(requester.is_canceled());
}

#[tokio::test]
async fn test_cancel_all_unblocks_every_operation() {
    let registry = Registry::start(42350).await;
    let app = registry.attach("server").await;

    let responder = Arc::new(Responder::create(&app, "first").await.unwrap());
    let receiving = {
        let responder = responder.clone();
        tokio::spawn(async move { responder.receive().await.is_none() })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    app.cancel_all();

    assert!(timeout(TEST_TIMEOUT, receiving).await.unwrap().unwrap());
}

#[tokio::test]
async fn test_multi_responder_workers() {
    let registry = Registry::start(42400).await;
    let server_app = registry.attach("server").await;
    let client_app = registry.attach("client").await;

    let router = Arc::new(ResponderRouter::create(&server_app, "pool").await.unwrap());
    let routing = {
        let router = router.clone();
        tokio::spawn(async move { router.run().await })
    };

    for worker_id in 0..2 {
        let worker = router.create_responder();
        tokio::spawn(async move {
            while let Some(request) = worker.receive().await {
                request.reply(format!("{}:{}", worker_id, request.get_string())).unwrap();
            }
        });
    }

    let target = instance_of(&client_app, &server_app).await;
    let mut requesters = Vec::new();
    for _ in 0..3 {
        requesters.push(Requester::create(&client_app, &target, "pool").await.unwrap());
    }

    for (i, requester) in requesters.iter().enumerate() {
        requester.send(format!("r{}", i)).await.unwrap();
    }
    for (i, requester) in requesters.iter().enumerate() {
        let reply = timeout(TEST_TIMEOUT, requester.receive())
            .await
            .unwrap()
            .unwrap();
        let reply = String::from_utf8(reply.to_vec()).unwrap();
        assert!(reply.ends_with(&format!(":r{}", i)), "reply {}", reply);
    }

    router.cancel();
    timeout(TEST_TIMEOUT, routing).await.unwrap().unwrap();
    assert!(router.is_canceled());
}

#[tokio::test]
async fn test_oversized_request_refused() {
    let registry = Registry::start(42450).await;
    let server_app = registry.attach("server").await;
    let client_app = This::init(registry.client_config().max_part_size(1024), "client")
        .await
        .unwrap();

    let responder = Responder::create(&server_app, "bounded").await.unwrap();
    tokio::spawn(async move {
        while let Some(request) = responder.receive().await {
            request.reply(request.get().clone()).unwrap();
        }
    });

    let target = instance_of(&client_app, &server_app).await;
    let requester = Requester::create(&client_app, &target, "bounded").await.unwrap();

    let result = requester.send(vec![0u8; 4096]).await;
    assert!(matches!(result, Err(Error::MessageTooLarge(_))));

    // The connection survives the refused request.
    requester.send("fits").await.unwrap();
    let reply = timeout(TEST_TIMEOUT, requester.receive()).await.unwrap();
    assert_eq!(reply, Some(Bytes::from_static(b"fits")));
}

#[tokio::test]
async fn test_name_reusable_after_terminate() {
    let registry = Registry::start(42500).await;
    let app = registry.attach("server").await;

    let first = Responder::create(&app, "reused").await.unwrap();
    first.terminate().await;
    drop(first);
    let second = Responder::create(&app, "reused").await.unwrap();
    second.terminate().await;

    let router = ResponderRouter::create(&app, "reused").await.unwrap();
    router.terminate().await;
    drop(router);
    let _again = ResponderRouter::create(&app, "reused").await.unwrap();
}

#[tokio::test]
async fn test_requests_through_proxy() {
    let registry = Registry::start(42550).await;
    let proxy_port = registry.server.responder_proxy_addr().port();
    let server_app = registry.attach("server").await;
    let client_app = This::init(registry.client_config().use_proxy(true), "client")
        .await
        .unwrap();

    let responder = Responder::create(&server_app, "echo").await.unwrap();
    let serving = tokio::spawn(async move {
        let request = responder.receive().await.unwrap();
        assert_eq!(request.requester().server_proxy_port, proxy_port);
        request.reply(request.get_string().to_uppercase()).unwrap();
        responder
    });

    let router = Arc::new(ResponderRouter::create(&server_app, "pool").await.unwrap());
    {
        let router = router.clone();
        tokio::spawn(async move { router.run().await });
    }
    let worker = router.create_responder();
    tokio::spawn(async move {
        while let Some(request) = worker.receive().await {
            request.reply(format!("pool:{}", request.get_string())).unwrap();
        }
    });

    let target = instance_of(&client_app, &server_app).await;

    let direct = Requester::create(&client_app, &target, "echo").await.unwrap();
    assert!(direct.to_string().ends_with(&format!(":{}", proxy_port)));
    direct.send("hello").await.unwrap();
    let reply = timeout(TEST_TIMEOUT, direct.receive()).await.unwrap();
    assert_eq!(reply, Some(Bytes::from_static(b"HELLO")));
    timeout(TEST_TIMEOUT, serving).await.unwrap().unwrap();

    let pooled = Requester::create(&client_app, &target, "pool").await.unwrap();
    for i in 0..3 {
        pooled.send(format!("r{}", i)).await.unwrap();
        let reply = timeout(TEST_TIMEOUT, pooled.receive()).await.unwrap();
        assert_eq!(reply, Some(Bytes::from(format!("pool:r{}", i))));
    }
}
