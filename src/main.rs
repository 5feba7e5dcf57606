/// Binlog 이벤트를 JSON 한 줄씩 출력하는 예제
///
/// 접속 정보와 시작 위치는 `BINLOG_*` 환경 변수로 지정합니다.
use mysql_binlog_stream::{BinlogStream, StreamConfig};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 초기화
    tracing_subscriber::fmt::init();

    let config = StreamConfig::from_env()?;
    info!(
        "Starting binlog stream from {}:{} (server_id {})",
        config.connection.hostname, config.connection.port, config.server_id
    );

    let mut stream = BinlogStream::connect(config).await?;

    while let Some(event) = stream.next_event().await? {
        println!("{}", event.to_json()?);
        info!("Position: {}", stream.position());
    }

    // 재시작용 위치
    println!("{}", stream.position().to_json()?);
    stream.close().await?;
    Ok(())
}
