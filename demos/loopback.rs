use std::sync::Arc;

use quanta::Instant;
use rdxfer::prelude::*;

const LEN: usize = 1 << 20;

fn main() -> anyhow::Result<()> {
    let fabric = Arc::new(SoftFabric::new());
    println!("devices: {:?}", fabric.device_names()?);

    let mut src = vec![0x14u8; LEN];
    let mut dst = vec![0u8; LEN];

    let mut engine = TransferEngine::new(fabric);
    engine.init_link(0, SoftFabric::ROCE_DEVICE, 1, LinkType::Ethernet)?;
    engine.init_link(1, SoftFabric::ROCE_DEVICE, 1, LinkType::Ethernet)?;
    let (client, server) = (engine.link(0)?, engine.link(1)?);

    // SAFETY: the buffers outlive the engine.
    unsafe {
        client.register_memory("kv", dst.as_mut_ptr(), LEN)?;
        server.register_memory("kv", src.as_mut_ptr(), LEN)?;
    }

    // Exchange through JSON, as a side channel would.
    let to_server = client.exchange_payload()?.to_json()?;
    let to_client = server.exchange_payload()?.to_json()?;
    println!("client payload: {}", to_server);

    let from_server = ExchangePayload::from_json(&to_client)?;
    let from_client = ExchangePayload::from_json(&to_server)?;
    client.connect(&from_server.rdma_info)?;
    server.connect(&from_client.rdma_info)?;
    client.apply_remote_regions(&from_server)?;
    server.apply_remote_regions(&from_client)?;

    let time = Instant::now();
    client.read_async(&Assignment::new("kv", 0, 0, LEN as u64))?.wait()?;
    println!("Time elapsed (single READ): {:?}", time.elapsed());

    dst.fill(0);
    let batch = Assignment::new("kv", 0, 0, LEN as u64).split(64 << 10);
    let time = Instant::now();
    let handle = client.read_batch_async(&batch)?;
    futures::executor::block_on(handle)?;
    println!(
        "Time elapsed (batch of {} READs): {:?}",
        batch.len(),
        time.elapsed()
    );
    println!("{:?}", client.stats());

    drop(engine);
    assert_eq!(dst, src);
    Ok(())
}
