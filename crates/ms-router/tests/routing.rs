use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use ms_router::{ChannelError, ChannelKind, ChannelRouter, ChannelValue, Route, SemanticType};
use parking_lot::Mutex;

#[test]
fn device_style_routes_resolve_to_typed_channels() -> Result<()> {
    let store = Arc::new(Mutex::new(0.0_f64));
    let router = ChannelRouter::new();

    router.add_route(Route::new(
        r"[A-Z]+:\w+:\d+:DESC",
        SemanticType::Text,
        Arc::new(|name| Ok(ChannelValue::Text(format!("description of {name}")))),
    )?);
    let read_store = Arc::clone(&store);
    let write_store = Arc::clone(&store);
    router.add_route(
        Route::new(
            r"QUAD:\w+:\d+:BCTRL",
            SemanticType::Double,
            Arc::new(move |_| Ok(ChannelValue::Double(*read_store.lock()))),
        )?
        .with_setter(Arc::new(move |_, value| {
            *write_store.lock() = value.as_f64().ok_or_else(|| ChannelError::Handler("not numeric".into()))?;
            Ok(())
        })),
    );
    router.add_route(Route::new(
        r"QUAD:\w+:\d+:BACT",
        SemanticType::Double,
        Arc::new(|_| Ok(ChannelValue::Double(0.5))),
    )?);

    let desc = router.get("QUAD:LI21:201:DESC")?;
    assert_eq!(desc.kind(), ChannelKind::Char);
    assert_eq!(desc.read()?, ChannelValue::Text("description of QUAD:LI21:201:DESC".into()));

    let bctrl = router.get("QUAD:LI21:201:BCTRL")?;
    bctrl.write(ChannelValue::Integer(3))?;
    assert_eq!(*store.lock(), 3.0);
    assert_eq!(bctrl.read()?, ChannelValue::Double(3.0));

    let bact = router.get("QUAD:LI21:201:BACT")?;
    assert_eq!(
        bact.write(ChannelValue::Double(1.0)),
        Err(ChannelError::ReadOnly("QUAD:LI21:201:BACT".into()))
    );
    Ok(())
}

#[tokio::test]
async fn subscription_hooks_follow_monitor_lifecycle() -> Result<()> {
    let active = Arc::new(AtomicUsize::new(0));
    let router = ChannelRouter::new();
    let up = Arc::clone(&active);
    let down = Arc::clone(&active);
    router.add_route(
        Route::new("BPM", SemanticType::Double, Arc::new(|_| Ok(ChannelValue::Double(0.0))))?
            .on_subscribe(Arc::new(move |_| {
                up.fetch_add(1, Ordering::SeqCst);
            }))
            .on_unsubscribe(Arc::new(move |_| {
                down.fetch_sub(1, Ordering::SeqCst);
            })),
    );

    let channel = router.get("BPM:LI21:201:X")?;
    let mut rx = channel.subscribe();
    assert_eq!(active.load(Ordering::SeqCst), 1);

    router.get("BPM:LI21:201:X")?.post(ChannelValue::Double(0.25))?;
    rx.changed().await?;
    assert_eq!(*rx.borrow(), ChannelValue::Double(0.25));

    channel.unsubscribe();
    assert_eq!(active.load(Ordering::SeqCst), 0);
    Ok(())
}
