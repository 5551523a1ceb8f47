use std::collections::{BTreeMap, VecDeque};

use sink_api::Row;

// ═══════════════════════════════════════════════════════════════
//  Policy
// ═══════════════════════════════════════════════════════════════

/// Когда буфер потока просит flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferPolicy {
    /// Начальный порог по числу строк.
    pub batch_size: usize,
    /// Порог по (примерному) объёму JSON строк в очереди.
    pub max_batch_bytes: usize,
    /// Шаг расширения порога после rate limit.
    pub batch_size_increment: usize,
    /// Потолок для расширения.
    pub max_batch_size: usize,
}

impl Default for BufferPolicy {
    fn default() -> Self {
        Self {
            batch_size: 50,
            max_batch_bytes: 1024 * 1024,
            batch_size_increment: 20,
            max_batch_size: 250,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferStatus {
    /// Строк в очереди после append.
    pub size: usize,
    pub should_flush: bool,
}

/// Строки, изъятые из очереди для записи.
///
/// `first_seq..=last_seq` - порядковые номера строк в потоке (с 1).
/// Пока batch не записан, владелец batch'а отвечает за строки; при ошибке
/// они возвращаются в буфер через `restore`.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub stream: String,
    pub rows: Vec<Row>,
    pub first_seq: u64,
    pub last_seq: u64,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

// ═══════════════════════════════════════════════════════════════
//  RecordBuffer
// ═══════════════════════════════════════════════════════════════

#[derive(Debug)]
struct StreamQueue {
    rows: VecDeque<Row>,
    bytes: usize,
    /// Номер последней добавленной строки.
    appended_seq: u64,
    /// Текущий порог flush'а (растёт после rate limit).
    limit: usize,
}

impl StreamQueue {
    fn front_seq(&self) -> u64 {
        self.appended_seq + 1 - self.rows.len() as u64
    }
}

fn row_bytes(row: &Row) -> usize {
    serde_json::to_vec(row).map(|v| v.len()).unwrap_or(0)
}

/// Очереди валидированных строк по потокам.
///
/// Буфер сам никогда не теряет строки: удаляет их только `drain*`,
/// передавая владение вызывающему.
#[derive(Debug)]
pub struct RecordBuffer {
    policy: BufferPolicy,
    streams: BTreeMap<String, StreamQueue>,
}

impl RecordBuffer {
    pub fn new(policy: BufferPolicy) -> Self {
        Self { policy, streams: BTreeMap::new() }
    }

    fn queue(&mut self, stream: &str) -> &mut StreamQueue {
        let limit = self.policy.batch_size;
        self.streams.entry(stream.to_string()).or_insert_with(|| StreamQueue {
            rows: VecDeque::new(),
            bytes: 0,
            appended_seq: 0,
            limit,
        })
    }

    pub fn append(&mut self, stream: &str, row: Row) -> BufferStatus {
        let max_bytes = self.policy.max_batch_bytes;
        let queue = self.queue(stream);
        queue.bytes += row_bytes(&row);
        queue.rows.push_back(row);
        queue.appended_seq += 1;
        let size = queue.rows.len();
        BufferStatus {
            size,
            should_flush: size >= queue.limit || queue.bytes >= max_bytes,
        }
    }

    /// Забрать все ожидающие строки потока.
    pub fn drain(&mut self, stream: &str) -> Option<Batch> {
        self.take(stream, usize::MAX)
    }

    /// Забрать не больше текущего порога строк (один запрос к store).
    pub fn drain_batch(&mut self, stream: &str) -> Option<Batch> {
        let limit = self.limit(stream);
        self.take(stream, limit)
    }

    fn take(&mut self, stream: &str, max_rows: usize) -> Option<Batch> {
        let queue = self.streams.get_mut(stream)?;
        if queue.rows.is_empty() {
            return None;
        }
        let first_seq = queue.front_seq();
        let count = queue.rows.len().min(max_rows.max(1));
        let rows: Vec<Row> = queue.rows.drain(..count).collect();
        queue.bytes = queue.rows.iter().map(row_bytes).sum();
        Some(Batch {
            stream: stream.to_string(),
            first_seq,
            last_seq: first_seq + rows.len() as u64 - 1,
            rows,
        })
    }

    /// Вернуть незаписанный batch в голову очереди (порядок сохраняется).
    pub fn restore(&mut self, batch: Batch) {
        let queue = self.queue(&batch.stream);
        queue.bytes += batch.rows.iter().map(row_bytes).sum::<usize>();
        for row in batch.rows.into_iter().rev() {
            queue.rows.push_front(row);
        }
    }

    /// Расширить порог потока после rate limit. Возвращает новый порог.
    pub fn widen(&mut self, stream: &str) -> usize {
        let step = self.policy.batch_size_increment;
        let ceiling = self.policy.max_batch_size.max(self.policy.batch_size);
        let queue = self.queue(stream);
        queue.limit = (queue.limit + step).min(ceiling);
        queue.limit
    }

    pub fn limit(&self, stream: &str) -> usize {
        self.streams
            .get(stream)
            .map(|q| q.limit)
            .unwrap_or(self.policy.batch_size)
    }

    pub fn len(&self, stream: &str) -> usize {
        self.streams.get(stream).map(|q| q.rows.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.streams.values().all(|q| q.rows.is_empty())
    }

    /// Сколько строк потока когда-либо попало в буфер.
    pub fn appended_seq(&self, stream: &str) -> u64 {
        self.streams.get(stream).map(|q| q.appended_seq).unwrap_or(0)
    }

    /// Готов ли поток к flush'у по порогам политики.
    pub fn is_due(&self, stream: &str) -> bool {
        self.streams.get(stream).is_some_and(|q| {
            !q.rows.is_empty() && (q.rows.len() >= q.limit || q.bytes >= self.policy.max_batch_bytes)
        })
    }

    /// Потоки с непустой очередью, по имени.
    pub fn pending_streams(&self) -> Vec<String> {
        self.streams
            .iter()
            .filter(|(_, q)| !q.rows.is_empty())
            .map(|(name, _)| name.clone())
            .collect()
    }
}
